use std::time::Duration;
use anyhow::bail;

/// IPv4 / UDP ceiling for the payload of a single datagram
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Clone)]
pub struct SrmConfig {
    /// Lower bound for the interval between two SESSION advertisements. The advertiser starts
    ///  with this interval and adjusts it based on the observed bandwidth.
    pub session_interval_min: Duration,
    /// Upper bound for the interval between two SESSION advertisements
    pub session_interval_max: Duration,
    /// The new interval is `factor * current / (session bandwidth / aggregate bandwidth)`
    pub session_bandwidth_factor: f64,

    /// Payloads are retained for this long after they were received (or last repaired), and
    ///  can be used to answer REQUESTs during that time. After that, they are evicted.
    pub cache_retention: Duration,
    pub eviction_interval: Duration,

    /// No request or repair timer fires sooner than this. While the distance to a payload's
    ///  source is unknown, timers fire after exactly this backoff.
    pub backoff_floor: Duration,
    /// Upper bound for a single backoff round. Request timers double their backoff with every
    ///  iteration, and without a cap they would overflow eventually.
    pub max_backoff: Duration,

    pub initial_c1: f64,
    pub initial_c2: f64,
    /// weight of a new value in the moving averages of duplicate requests and request delay
    pub ewma_alpha: f64,
    pub target_avg_duplicates: f64,
    pub duplicates_epsilon: f64,
    pub low_duplicates_threshold: f64,
    /// in units of the distance to the source
    pub target_avg_delay: f64,

    /// REQUESTs for a payload are ignored within `factor * distance to source` after it was
    ///  received or repaired
    pub repair_suppression_factor: f64,

    /// >0 and <= 1
    pub distance_moving_avg_new_weight: f64,

    /// If a gap in a sender's sequence numbers is wider than this, only the newest sequence
    ///  numbers are recovered
    pub max_recovery_gap: u64,

    pub max_datagram_size: usize,

    /// Applied to sockets created by `ReliableSocket::join`
    pub multicast_loop: bool,
    pub multicast_ttl: u32,
}

impl Default for SrmConfig {
    fn default() -> Self {
        SrmConfig {
            session_interval_min: Duration::from_secs(1),
            session_interval_max: Duration::from_secs(10),
            session_bandwidth_factor: 20.0,
            cache_retention: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(1),
            backoff_floor: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(3600),
            initial_c1: 2.0,
            initial_c2: 2.0,
            ewma_alpha: 0.25,
            target_avg_duplicates: 1.0,
            duplicates_epsilon: 0.1,
            low_duplicates_threshold: 0.25,
            target_avg_delay: 1.0,
            repair_suppression_factor: 3.0,
            distance_moving_avg_new_weight: 0.5,
            max_recovery_gap: 1024,
            max_datagram_size: MAX_UDP_PAYLOAD,
            multicast_loop: true,
            multicast_ttl: 1,
        }
    }
}

impl SrmConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_interval_min.is_zero() {
            bail!("minimum session interval must be positive");
        }
        if self.session_interval_min > self.session_interval_max {
            bail!("minimum session interval {:?} exceeds the maximum {:?}", self.session_interval_min, self.session_interval_max);
        }
        if self.backoff_floor > self.max_backoff {
            bail!("backoff floor {:?} exceeds the maximum backoff {:?}", self.backoff_floor, self.max_backoff);
        }
        if self.eviction_interval.is_zero() {
            bail!("eviction interval must be positive");
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            bail!("moving average weight must be in (0, 1], was {}", self.ewma_alpha);
        }
        if !(self.distance_moving_avg_new_weight > 0.0 && self.distance_moving_avg_new_weight <= 1.0) {
            bail!("distance moving average weight must be in (0, 1], was {}", self.distance_moving_avg_new_weight);
        }
        if !(self.repair_suppression_factor.is_finite() && self.repair_suppression_factor >= 0.0) {
            bail!("repair suppression factor must be a non-negative number, was {}", self.repair_suppression_factor);
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("maximum datagram size {} exceeds the UDP limit of {}", self.max_datagram_size, MAX_UDP_PAYLOAD);
        }
        if self.max_recovery_gap == 0 {
            bail!("maximum recovery gap must be positive");
        }
        Ok(())
    }
}
