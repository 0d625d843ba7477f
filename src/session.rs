use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};
use crate::config::SrmConfig;
use crate::envelope::{EnvelopeBody, SessionBody, TimestampEcho};
use crate::membership::MembershipTable;
use crate::outbound::Outbound;

/// Millisecond timestamps for SESSION advertisements, relative to when the group was joined.
///  They are only ever interpreted by the member that created them, so there is no need for
///  synchronized clocks.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    reference: Instant,
}

impl SessionClock {
    pub fn new() -> SessionClock {
        SessionClock {
            reference: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.reference.elapsed().as_millis() as u64
    }

    /// Derives a distance sample from another member echoing one of our own timestamps: half
    ///  the round trip, minus the time the echo was held by the other member. Returns `None`
    ///  for echoes that do not fit our clock.
    pub fn distance_sample(&self, echo: &TimestampEcho) -> Option<Duration> {
        let round_trip = self.now_millis()
            .checked_sub(echo.timestamp_millis)?
            .checked_sub(echo.held_millis)?;
        Some(Duration::from_millis(round_trip) / 2)
    }
}

/// The interval until the next advertisement, scaled so that SESSION traffic stays a small
///  fraction of the total traffic
pub fn next_session_interval(current: Duration, session_bytes: u64, aggregate_bytes: u64, config: &SrmConfig) -> Duration {
    let ratio = session_bytes as f64 / aggregate_bytes as f64;
    let seconds = config.session_bandwidth_factor * current.as_secs_f64() / ratio;

    if seconds.is_nan() || seconds <= config.session_interval_min.as_secs_f64() {
        return config.session_interval_min;
    }
    if seconds >= config.session_interval_max.as_secs_f64() {
        return config.session_interval_max;
    }
    Duration::from_secs_f64(seconds)
}

pub struct SessionAdvertiser {
    config: Arc<SrmConfig>,
    outbound: Arc<Outbound>,
    membership: Arc<MembershipTable>,
    clock: SessionClock,
}

impl SessionAdvertiser {
    pub fn new(config: Arc<SrmConfig>, outbound: Arc<Outbound>, membership: Arc<MembershipTable>, clock: SessionClock) -> SessionAdvertiser {
        SessionAdvertiser {
            config,
            outbound,
            membership,
            clock,
        }
    }

    /// Advertises right away, and then periodically until `shutdown` changes
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = self.config.session_interval_min;
        let mut is_first = true;

        loop {
            match self.advertise().await {
                Ok(num_bytes) => self.outbound.bandwidth().add_session(num_bytes),
                Err(e) => warn!("error sending SESSION: {}", e),
            }

            if !is_first {
                let (session_bytes, aggregate_bytes) = self.outbound.bandwidth().take();
                let new_interval = next_session_interval(interval, session_bytes, aggregate_bytes, &self.config);
                if new_interval != interval {
                    info!("session advertisement interval {:?} -> {:?} ({} of {} bytes were SESSION traffic)", interval, new_interval, session_bytes, aggregate_bytes);
                    interval = new_interval;
                }
            }
            is_first = false;

            select! {
                _ = time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("stopping session advertisements");
                    break;
                }
            }
        }
    }

    async fn advertise(&self) -> anyhow::Result<usize> {
        let mut view = self.membership.current_view().await;
        view.insert(self.outbound.self_id().clone());

        let body = SessionBody {
            timestamp_millis: self.clock.now_millis(),
            view,
            echoes: self.membership.echoes().await,
        };
        trace!("advertising session: {:?}", body);
        self.outbound.send_control(EnvelopeBody::Session(body)).await
    }
}
