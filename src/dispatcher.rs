use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::select;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, trace, warn};
use crate::backoff::BackoffPool;
use crate::delivery_cache::DeliveryCache;
use crate::envelope::{DeliveryKey, Envelope, EnvelopeBody, MemberId, RepairBody, RequestBody, SessionBody};
use crate::membership::{MembershipTable, Observation, SequenceUpdate};
use crate::outbound::Outbound;
use crate::session::SessionClock;
use crate::transport::MulticastTransport;
use crate::util::random::Random;

/// larger than any valid datagram, so that oversized datagrams are not silently truncated
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// after a failed receive, the dispatcher pauses before retrying, doubling the pause for every
///  consecutive failure
const MIN_RECV_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RECV_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Receives all traffic for a joined group and drives loss detection, delivery and repairs
pub struct Dispatcher<R: Random> {
    transport: Arc<dyn MulticastTransport>,
    outbound: Arc<Outbound>,
    membership: Arc<MembershipTable>,
    cache: Arc<DeliveryCache>,
    backoff: Arc<BackoffPool<R>>,
    clock: SessionClock,
}

impl <R: Random + 'static> Dispatcher<R> {
    pub fn new(
        transport: Arc<dyn MulticastTransport>,
        outbound: Arc<Outbound>,
        membership: Arc<MembershipTable>,
        cache: Arc<DeliveryCache>,
        backoff: Arc<BackoffPool<R>>,
        clock: SessionClock,
    ) -> Dispatcher<R> {
        Dispatcher {
            transport,
            outbound,
            membership,
            cache,
            backoff,
            clock,
        }
    }

    fn self_id(&self) -> &MemberId {
        self.outbound.self_id()
    }

    /// Handles incoming datagrams until `shutdown` changes, and leaves the group after that
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut receive_buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

        let mut retry_delay = Duration::ZERO;

        loop {
            select! {
                recv_result = self.transport.recv(&mut receive_buffer) => {
                    match recv_result {
                        Ok(len) => {
                            retry_delay = Duration::ZERO;
                            self.on_datagram(&receive_buffer[..len]).await;
                            continue;
                        }
                        Err(e) => {
                            retry_delay = (retry_delay * 2).clamp(MIN_RECV_RETRY_DELAY, MAX_RECV_RETRY_DELAY);
                            error!("error receiving datagram, retrying in {:?}: {}", retry_delay, e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("shutting down dispatcher");
                    break;
                }
            }

            select! {
                _ = time::sleep(retry_delay) => {}
                _ = shutdown.changed() => {
                    debug!("shutting down dispatcher");
                    break;
                }
            }
        }

        if let Err(e) = self.transport.leave_group().await {
            warn!("error leaving the multicast group: {}", e);
        }
    }

    pub async fn on_datagram(&self, buf: &[u8]) {
        self.outbound.bandwidth().add_aggregate(buf.len());

        match Envelope::deser(buf) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => warn!("dropping unparseable datagram of {} bytes: {}", buf.len(), e),
        }
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        trace!("received {} #{} from {:?}", envelope.body.kind(), envelope.sequence, envelope.from);

        if &envelope.from == self.self_id() {
            // looped back
            if let EnvelopeBody::Data(_) = &envelope.body {
                self.membership.update(&envelope.from, Observation::Data(envelope.sequence), None).await;
            }
            return;
        }

        let observation = match &envelope.body {
            EnvelopeBody::Data(_) => Observation::Data(envelope.sequence),
            _ => Observation::Progress { next_sequence: envelope.sequence },
        };
        let distance_sample = match &envelope.body {
            EnvelopeBody::Session(body) => self.distance_sample(body),
            _ => None,
        };

        let update = self.membership.update(&envelope.from, observation, distance_sample).await;
        let is_fresh = match update {
            SequenceUpdate::Fresh { missing } => {
                self.request_missing(&envelope.from, missing).await;
                true
            }
            SequenceUpdate::Progress { missing } => {
                self.request_missing(&envelope.from, missing).await;
                false
            }
            SequenceUpdate::Duplicate => false,
        };

        let from = envelope.from;
        match envelope.body {
            EnvelopeBody::Session(body) => self.on_session(from, body).await,
            EnvelopeBody::Data(payload) => self.on_data(DeliveryKey::new(from, envelope.sequence), payload, is_fresh).await,
            EnvelopeBody::Request(body) => self.on_request(from, body).await,
            EnvelopeBody::Repair(body) => self.on_repair(from, body).await,
        }
    }

    fn distance_sample(&self, body: &SessionBody) -> Option<Duration> {
        body.echoes.iter()
            .find(|echo| &echo.member == self.self_id())
            .and_then(|echo| self.clock.distance_sample(echo))
    }

    async fn request_missing(&self, member: &MemberId, missing: Vec<u64>) {
        if !missing.is_empty() {
            debug!("detected missing payloads from {:?}: {:?}", member, missing);
        }
        for sequence in missing {
            self.backoff.request(DeliveryKey::new(member.clone(), sequence)).await;
        }
    }

    async fn on_session(&self, from: MemberId, body: SessionBody) {
        self.membership.record_session(&from, body.timestamp_millis).await;

        for member in &body.view {
            if member != self.self_id() && !self.membership.is_known(member).await {
                trace!("learned about {:?} from {:?}'s view", member, from);
                self.membership.update(member, Observation::Contact, None).await;
            }
        }
    }

    async fn on_data(&self, key: DeliveryKey, payload: Bytes, is_fresh: bool) {
        if !is_fresh {
            trace!("ignoring duplicate DATA {:?}", key);
            return;
        }

        self.cache.put(key.clone(), payload).await;
        self.backoff.cancel_request(&key).await;
    }

    async fn on_request(&self, from: MemberId, body: RequestBody) {
        let key = body.key;
        debug!("received REQUEST for {:?} from {:?}", key, from);

        if let Some(distance_millis) = body.distance_millis {
            if &key.member != self.self_id() {
                self.membership.seed_distance(&key.member, Duration::from_millis(distance_millis)).await;
            }
        }

        if self.backoff.has_request(&key).await {
            self.backoff.postpone(&key).await;
        }
        else {
            self.backoff.repair(key).await;
        }
    }

    async fn on_repair(&self, from: MemberId, body: RepairBody) {
        let key = body.key;
        debug!("received REPAIR for {:?} from {:?}", key, from);

        if &key.member != self.self_id() {
            match self.membership.update(&key.member, Observation::Data(key.sequence), None).await {
                SequenceUpdate::Fresh { missing } => {
                    self.request_missing(&key.member, missing).await;
                    self.cache.put(key.clone(), body.payload).await;
                }
                _ => {
                    self.cache.retain(key.clone(), body.payload).await;
                }
            }
        }

        self.backoff.cancel_request(&key).await;
        self.backoff.cancel_repair(&key).await;
        self.cache.stamp(&key).await;
    }
}
