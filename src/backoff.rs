//! Loss recovery timers.
//!
//! When a member detects a loss, it does not send a REQUEST right away but waits for a randomized
//!  backoff, growing with the distance to the payload's source. If another member's REQUEST for
//!  the same payload arrives in the meantime, the local timer is postponed, so that ideally only
//!  one REQUEST per loss is sent to the group. The same is done for REPAIRs: every member holding
//!  the payload schedules one, and the first one that is sent cancels all others.
//!
//! Every timer is a separate lightweight task. Tasks are interrupted cooperatively, see
//!  [timer::TimerControl].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};
use crate::backoff::adaptive::{repair_expiry, repair_spread, request_expiry, AdaptiveParams};
use crate::backoff::timer::{new_timer, Interrupt, TaskState, TimerControl, TimerTask};
use crate::config::SrmConfig;
use crate::delivery_cache::DeliveryCache;
use crate::envelope::{DeliveryKey, EnvelopeBody, RepairBody, RequestBody};
use crate::membership::MembershipTable;
use crate::outbound::Outbound;
use crate::util::random::{Random, RngRandom};

pub mod adaptive;
pub mod timer;

struct TimerEntry {
    id: u64,
    control: TimerControl,
    join_handle: JoinHandle<()>,
}

pub struct BackoffPool<R: Random> {
    config: Arc<SrmConfig>,
    outbound: Arc<Outbound>,
    membership: Arc<MembershipTable>,
    cache: Arc<DeliveryCache>,
    params: Mutex<AdaptiveParams>,
    requests: Mutex<FxHashMap<DeliveryKey, TimerEntry>>,
    repairs: Mutex<FxHashMap<DeliveryKey, TimerEntry>>,
    /// cancelled tasks that may still be finishing up
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_timer_id: AtomicU64,
    is_closed: AtomicBool,
    pd: PhantomData<R>,
}

impl BackoffPool<RngRandom> {
    pub fn new(config: Arc<SrmConfig>, outbound: Arc<Outbound>, membership: Arc<MembershipTable>, cache: Arc<DeliveryCache>) -> BackoffPool<RngRandom> {
        Self::new_with_random(config, outbound, membership, cache)
    }
}

impl <R: Random + 'static> BackoffPool<R> {
    pub fn new_with_random(config: Arc<SrmConfig>, outbound: Arc<Outbound>, membership: Arc<MembershipTable>, cache: Arc<DeliveryCache>) -> BackoffPool<R> {
        BackoffPool {
            params: Mutex::new(AdaptiveParams::new(&config)),
            config,
            outbound,
            membership,
            cache,
            requests: Default::default(),
            repairs: Default::default(),
            retired: Default::default(),
            next_timer_id: AtomicU64::new(0),
            is_closed: AtomicBool::new(false),
            pd: PhantomData::default(),
        }
    }

    pub async fn params(&self) -> AdaptiveParams {
        *self.params.lock().await
    }

    pub async fn has_request(&self, key: &DeliveryKey) -> bool {
        self.requests.lock().await.contains_key(key)
    }

    pub async fn has_repair(&self, key: &DeliveryKey) -> bool {
        self.repairs.lock().await.contains_key(key)
    }

    /// distance to the payload's source, which is zero for locally sent payloads
    async fn distance_to(&self, key: &DeliveryKey) -> Option<Duration> {
        if &key.member == self.outbound.self_id() {
            return Some(Duration::ZERO);
        }
        self.membership.distance(&key.member).await
    }

    fn spawn_timer<C, F>(&self, f: C) -> TimerEntry
    where C: FnOnce(u64, TimerTask) -> F,
          F: Future<Output=()> + Send + 'static,
    {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let (control, task) = new_timer();
        let join_handle = tokio::spawn(f(id, task));
        TimerEntry { id, control, join_handle }
    }

    /// Starts a request timer for a payload that was detected as missing
    pub async fn request(self: &Arc<Self>, key: DeliveryKey) {
        let mut requests = self.requests.lock().await;
        if self.is_closed.load(Ordering::Acquire) {
            trace!("pool is closed - not requesting {:?}", key);
            return;
        }
        if requests.contains_key(&key) {
            trace!("request timer for {:?} is already running", key);
            return;
        }

        debug!("scheduling request timer for {:?}", key);
        let pool = self.clone();
        let task_key = key.clone();
        let entry = self.spawn_timer(|_, task| async move {
            pool.run_request(task_key, task).await
        });
        requests.insert(key, entry);
    }

    /// Schedules a REPAIR for a payload that another member requested, unless it was received
    ///  or repaired recently enough that the REQUEST is probably stale. Without a distance
    ///  estimate for the payload's source, there is no such suppression.
    pub async fn repair(self: &Arc<Self>, key: DeliveryKey) {
        let last_repaired = match self.cache.get(&key).await {
            Some((_, last_repaired)) => last_repaired,
            None => {
                trace!("{:?} is not cached - cannot repair", key);
                return;
            }
        };

        if let Some(distance) = self.distance_to(&key).await {
            let suppression_window = distance.mul_f64(self.config.repair_suppression_factor);
            let since_repaired = last_repaired.elapsed();
            if since_repaired < suppression_window {
                debug!("{:?} was repaired {:?} ago, suppressing repair for {:?}", key, since_repaired, suppression_window);
                return;
            }
        }

        let mut repairs = self.repairs.lock().await;
        if self.is_closed.load(Ordering::Acquire) {
            trace!("pool is closed - not repairing {:?}", key);
            return;
        }
        if repairs.contains_key(&key) {
            trace!("repair timer for {:?} is already pending", key);
            return;
        }

        let spread = repair_spread(self.membership.current_view().await.len());
        debug!("scheduling repair timer for {:?} with spread {}", key, spread);
        let pool = self.clone();
        let task_key = key.clone();
        let entry = self.spawn_timer(|id, task| async move {
            pool.run_repair(task_key, id, spread, task).await
        });
        repairs.insert(key, entry);
    }

    /// Called when another member's REQUEST for a payload arrives that is also requested locally.
    ///  This counts as a duplicate, and restarts the local backoff if the current round is more
    ///  than half through.
    pub async fn postpone(&self, key: &DeliveryKey) {
        let requests = self.requests.lock().await;
        let entry = match requests.get(key) {
            Some(entry) => entry,
            None => return,
        };

        if entry.control.state() != TaskState::Running {
            trace!("request timer for {:?} is not running - ignoring REQUEST from another member", key);
            return;
        }

        let duplicates = entry.control.count_duplicate().await;
        if let Some(round) = entry.control.round().await {
            let elapsed = round.started.elapsed();
            if elapsed > round.expire / 2 {
                debug!("postponing request timer for {:?} ({:?} of {:?} elapsed, {:?} duplicates)", key, elapsed, round.expire, duplicates);
                entry.control.interrupt(Interrupt::Postpone).await;
            }
            else {
                trace!("REQUEST for {:?} arrived early in the round ({:?} of {:?}) - not postponing", key, elapsed, round.expire);
            }
        }
    }

    pub async fn cancel_request(&self, key: &DeliveryKey) {
        let entry = self.requests.lock().await.remove(key);
        if let Some(entry) = entry {
            debug!("cancelling request timer for {:?}", key);
            self.retire(entry).await;
        }
    }

    pub async fn cancel_repair(&self, key: &DeliveryKey) {
        let entry = self.repairs.lock().await.remove(key);
        if let Some(entry) = entry {
            debug!("cancelling repair timer for {:?}", key);
            self.retire(entry).await;
        }
    }

    async fn retire(&self, entry: TimerEntry) {
        entry.control.interrupt(Interrupt::Done).await;
        let mut retired = self.retired.lock().await;
        retired.retain(|h| !h.is_finished());
        retired.push(entry.join_handle);
    }

    /// Stops accepting new timers, cancels all running timers and waits for their tasks to
    ///  terminate. No REQUEST or REPAIR is sent after this returns.
    pub async fn close(&self) {
        let requests = {
            let mut requests = self.requests.lock().await;
            self.is_closed.store(true, Ordering::Release);
            std::mem::take(&mut *requests)
        };
        let repairs = std::mem::take(&mut *self.repairs.lock().await);
        debug!("closing backoff pool with {} request and {} repair timers", requests.len(), repairs.len());

        for (key, entry) in requests.into_iter().chain(repairs) {
            trace!("cancelling timer for {:?}", key);
            self.retire(entry).await;
        }

        let handles = std::mem::take(&mut *self.retired.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("timer task terminated abnormally: {}", e);
            }
        }
    }

    async fn run_request(self: Arc<Self>, key: DeliveryKey, mut task: TimerTask) {
        task.set_state(TaskState::Running);

        let task_started = Instant::now();
        let mut iteration = 0u32;
        let mut num_sent = 0u32;
        let mut min_distance: Option<Duration> = None;

        loop {
            let distance = self.membership.distance(&key.member).await;
            let params = self.params().await;
            let expire = request_expiry(iteration, &params, R::gen_f64_range(0.0..1.0), distance, &self.config);
            task.start_round(expire).await;
            trace!("request timer for {:?}: iteration {} expires in {:?}", key, iteration, expire);

            // the backoff doubles only for rounds that were scaled by a distance estimate
            if distance.is_some() {
                iteration += 1;
            }

            select! {
                _ = time::sleep(expire) => {}
                interrupt = task.interrupted() => match interrupt {
                    Interrupt::Postpone => continue,
                    Interrupt::Done => break,
                }
            }

            let body = EnvelopeBody::Request(RequestBody {
                key: key.clone(),
                distance_millis: distance.map(|d| d.as_millis() as u64),
            });
            if let Err(e) = self.outbound.send_control(body).await {
                warn!("error sending REQUEST for {:?}: {}", key, e);
                continue;
            }
            num_sent += 1;

            let round_duplicates = task.take_duplicates().await;
            let distance_improved = matches!((distance, min_distance), (Some(d), Some(min)) if d < min);
            if let Some(d) = distance {
                min_distance = Some(min_distance.map_or(d, |min| min.min(d)));
            }

            let mut params = self.params.lock().await;
            *params = params.on_request_sent(round_duplicates, distance_improved, &self.config);
            debug!("sent REQUEST #{} for {:?} ({} duplicates) - now {:?}", num_sent, key, round_duplicates, *params);
        }

        task.set_state(TaskState::Cancelling);
        if num_sent > 0 {
            match self.distance_to(&key).await {
                Some(distance) => {
                    let delay = task_started.elapsed().as_secs_f64() / num_sent as f64 / distance.as_secs_f64();
                    if delay.is_finite() {
                        let mut params = self.params.lock().await;
                        *params = params.on_request_done(delay, &self.config);
                    }
                }
                None => trace!("distance to {:?} is unknown - no delay sample", key.member),
            }
        }
        debug!("request timer for {:?} done after {} REQUEST(s)", key, num_sent);
        task.set_state(TaskState::Done);
    }

    async fn run_repair(self: Arc<Self>, key: DeliveryKey, id: u64, spread: f64, mut task: TimerTask) {
        task.set_state(TaskState::Running);

        let distance = self.distance_to(&key).await;
        let expire = repair_expiry(spread, R::gen_f64_range(0.0..1.0), distance, &self.config);
        trace!("repair timer for {:?} expires in {:?}", key, expire);

        let sent = select! {
            _ = time::sleep(expire) => self.send_repair(&key).await,
            _ = task.interrupted() => false,
        };

        {
            let mut repairs = self.repairs.lock().await;
            if repairs.get(&key).map(|e| e.id == id).unwrap_or(false) {
                repairs.remove(&key);
            }
        }
        if sent {
            self.cache.stamp(&key).await;
        }
        task.set_state(TaskState::Done);
    }

    async fn send_repair(&self, key: &DeliveryKey) -> bool {
        let payload = match self.cache.get(key).await {
            Some((payload, _)) => payload,
            None => {
                debug!("{:?} was evicted from the cache - abandoning repair", key);
                return false;
            }
        };

        let body = EnvelopeBody::Repair(RepairBody {
            key: key.clone(),
            payload,
        });
        match self.outbound.send_control(body).await {
            Ok(_) => {
                debug!("sent REPAIR for {:?}", key);
                true
            }
            Err(e) => {
                warn!("error sending REPAIR for {:?} - abandoning: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, MemberId};
    use crate::transport::MockMulticastTransport;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use bytes::Bytes;

    struct Fixture {
        pool: Arc<BackoffPool<MockRandom>>,
        membership: Arc<MembershipTable>,
        cache: Arc<DeliveryCache>,
        sent: Arc<std::sync::Mutex<Vec<Envelope>>>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
            let mut transport = MockMulticastTransport::new();
            let recorded = sent.clone();
            transport.expect_send()
                .returning(move |buf| {
                    recorded.lock().unwrap().push(Envelope::deser(buf).unwrap());
                    Ok(())
                });

            let config = Arc::new(SrmConfig::default());
            let outbound = Arc::new(Outbound::new(Arc::new(transport), MemberId::from("self@1@1"), config.max_datagram_size));
            let membership = Arc::new(MembershipTable::new(config.clone()));
            let cache = Arc::new(DeliveryCache::new(config.cache_retention, config.eviction_interval));
            let pool = Arc::new(BackoffPool::<MockRandom>::new_with_random(config, outbound, membership.clone(), cache.clone()));
            Fixture { pool, membership, cache, sent }
        }

        async fn with_source_distance(millis: u64) -> Fixture {
            let f = Fixture::new();
            f.membership.seed_distance(&MemberId::from("a@1@1"), Duration::from_millis(millis)).await;
            f
        }

        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn key(sequence: u64) -> DeliveryKey {
        DeliveryKey::new(MemberId::from("a@1@1"), sequence)
    }

    fn assert_approx(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-6, "expected {}, was {}", expected, actual);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timer_backs_off_until_cancelled() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::with_source_distance(1000).await;
        f.pool.request(key(3)).await;
        f.pool.request(key(3)).await;
        assert!(f.pool.has_request(&key(3)).await);

        // (2 + 0.5*2) * 1s
        time::sleep(Duration::from_millis(2999)).await;
        assert!(f.sent().is_empty());
        time::sleep(Duration::from_millis(2)).await;
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, EnvelopeBody::Request(RequestBody { key: key(3), distance_millis: Some(1000) }));

        // C1 was adjusted to 1.85: 2 * (1.85 + 0.5*2) * 1s
        time::sleep(Duration::from_millis(5698)).await;
        assert_eq!(f.sent().len(), 1);
        time::sleep(Duration::from_millis(101)).await;
        assert_eq!(f.sent().len(), 2);

        f.pool.cancel_request(&key(3)).await;
        assert!(!f.pool.has_request(&key(3)).await);
        f.pool.close().await;

        let params = f.pool.params().await;
        assert_approx(params.c1, 1.7);
        assert_approx(params.c2, 2.0);
        assert_eq!(params.avg_duplicates, Some(0.0));
        // 8.8s for two REQUESTs, at a distance of 1s
        assert_approx(params.avg_delay.unwrap(), 4.4);
        assert_eq!(f.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timer_without_distance_fires_at_floor() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::new();
        f.pool.request(key(3)).await;

        // no scaling and no doubling while the distance is unknown
        time::sleep(Duration::from_millis(999)).await;
        assert!(f.sent().is_empty());
        for expected in 1..=3 {
            time::sleep(Duration::from_millis(if expected == 1 { 2 } else { 1000 })).await;
            assert_eq!(f.sent().len(), expected);
        }
        assert_eq!(f.sent()[0].body, EnvelopeBody::Request(RequestBody { key: key(3), distance_millis: None }));

        // the round that is running keeps its expiry. After that, the backoff is scaled by the
        //  distance, starting at the first iteration: (1.4 + 0.5*2) * 1s
        f.membership.seed_distance(&MemberId::from("a@1@1"), Duration::from_millis(1000)).await;
        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(f.sent().len(), 4);
        assert_approx(f.pool.params().await.c1, 1.4);
        time::sleep(Duration::from_millis(2398)).await;
        assert_eq!(f.sent().len(), 4);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(f.sent().len(), 5);

        f.pool.cancel_request(&key(3)).await;
        f.pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_postpone_only_late_in_the_round() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::with_source_distance(1000).await;
        f.pool.request(key(1)).await;

        time::sleep(Duration::from_secs(1)).await;
        f.pool.postpone(&key(1)).await;
        time::sleep(Duration::from_secs(1)).await;
        f.pool.postpone(&key(1)).await;

        // the round was restarted at 2s with a doubled backoff of 6s
        time::sleep(Duration::from_millis(5900)).await;
        assert!(f.sent().is_empty());
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.sent().len(), 1);

        // both REQUESTs from other members count as duplicates
        let params = f.pool.params().await;
        assert_eq!(params.avg_duplicates, Some(2.0));
        assert_approx(params.c1, 2.0);
        assert_approx(params.c2, 2.5);

        f.pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_postpone_without_timer_is_ignored() {
        let f = Fixture::new();
        f.pool.postpone(&key(1)).await;
        assert!(!f.pool.has_request(&key(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_suppression() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::with_source_distance(1000).await;
        f.pool.repair(key(1)).await;
        assert!(!f.pool.has_repair(&key(1)).await);

        f.cache.put(key(1), Bytes::from_static(b"abc")).await;
        f.pool.repair(key(1)).await;
        assert!(!f.pool.has_repair(&key(1)).await);

        time::sleep(Duration::from_millis(3001)).await;
        f.pool.repair(key(1)).await;
        f.pool.repair(key(1)).await;
        assert!(f.pool.has_repair(&key(1)).await);

        // nobody is in the view, so the backoff is at its floor
        time::sleep(Duration::from_millis(1001)).await;
        let sent = f.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, EnvelopeBody::Repair(RepairBody { key: key(1), payload: Bytes::from_static(b"abc") }));
        assert!(!f.pool.has_repair(&key(1)).await);
        let (_, last_repaired) = f.cache.get(&key(1)).await.unwrap();
        assert!(last_repaired.elapsed() <= Duration::from_millis(1));

        f.pool.repair(key(1)).await;
        assert!(!f.pool.has_repair(&key(1)).await);

        f.pool.close().await;
        assert_eq!(f.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_without_distance_is_not_suppressed() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::new();
        f.cache.put(key(1), Bytes::from_static(b"abc")).await;
        f.pool.repair(key(1)).await;
        assert!(f.pool.has_repair(&key(1)).await);

        time::sleep(Duration::from_millis(999)).await;
        assert!(f.sent().is_empty());
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(f.sent().len(), 1);
        f.pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_repairs_without_suppression() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::new();
        let own_key = DeliveryKey::new(MemberId::from("self@1@1"), 1);
        f.cache.retain(own_key.clone(), Bytes::from_static(b"abc")).await;
        f.pool.repair(own_key.clone()).await;
        assert!(f.pool.has_repair(&own_key).await);

        time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(f.sent().len(), 1);
        f.pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_repair() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::new();
        f.cache.retain(key(1), Bytes::from_static(b"abc")).await;
        time::sleep(Duration::from_secs(4)).await;

        f.pool.repair(key(1)).await;
        time::sleep(Duration::from_millis(500)).await;
        f.pool.cancel_repair(&key(1)).await;
        assert!(!f.pool.has_repair(&key(1)).await);

        time::sleep(Duration::from_secs(5)).await;
        assert!(f.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_terminates_all_timers() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect().return_const(0.5);

        let f = Fixture::new();
        f.cache.retain(key(10), Bytes::from_static(b"abc")).await;
        time::sleep(Duration::from_secs(4)).await;

        for sequence in 1..=5 {
            f.pool.request(key(sequence)).await;
        }
        f.pool.repair(key(10)).await;
        time::sleep(Duration::from_millis(500)).await;

        f.pool.close().await;
        for sequence in 1..=5 {
            assert!(!f.pool.has_request(&key(sequence)).await);
        }
        assert!(!f.pool.has_repair(&key(10)).await);

        f.pool.request(key(6)).await;
        assert!(!f.pool.has_request(&key(6)).await);

        time::sleep(Duration::from_secs(100)).await;
        assert!(f.sent().is_empty());
        // no REQUEST was sent, so there is no delay sample
        assert_eq!(f.pool.params().await.avg_delay, None);
    }
}
