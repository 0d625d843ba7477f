use std::collections::hash_map::Entry;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use crate::envelope::DeliveryKey;

/// Returned by a blocked `receive()` when the group is left while it is waiting
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceiveCancelled;

impl Display for ReceiveCancelled {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "receive was cancelled because the group was left")
    }
}

impl std::error::Error for ReceiveCancelled {}

struct CacheEntry {
    payload: Bytes,
    /// when the payload was received or last repaired
    stamped: Instant,
}

/// Recently seen payloads, for answering REQUESTs, plus the queue of payloads waiting for
///  delivery to the application.
///
/// Entries are evicted once they were not touched for the retention period, after which they can
///  no longer be used for repairs. Evicted entries are never re-delivered: deciding whether a
///  payload is new is the membership table's job, this cache only guards against re-queueing
///  while an entry is present.
pub struct DeliveryCache {
    retention: Duration,
    eviction_interval: Duration,
    entries: RwLock<FxHashMap<DeliveryKey, CacheEntry>>,
    delivery_sender: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    delivery_receiver: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl DeliveryCache {
    pub fn new(retention: Duration, eviction_interval: Duration) -> DeliveryCache {
        let (sender, receiver) = mpsc::unbounded_channel();
        DeliveryCache {
            retention,
            eviction_interval,
            entries: Default::default(),
            delivery_sender: Mutex::new(Some(sender)),
            delivery_receiver: Mutex::new(receiver),
        }
    }

    /// Stores a payload, enqueueing it for delivery if the key is not present yet. Returns
    ///  whether the payload was enqueued.
    pub async fn put(&self, key: DeliveryKey, payload: Bytes) -> bool {
        // the entries lock is held while enqueueing so the delivery order matches the order of
        //  insertion
        let mut entries = self.entries.write().await;
        match entries.entry(key) {
            Entry::Occupied(mut e) => {
                trace!("cache: overwriting {:?}", e.key());
                let entry = e.get_mut();
                entry.payload = payload;
                entry.stamped = Instant::now();
                false
            }
            Entry::Vacant(e) => {
                trace!("cache: storing {:?} for delivery", e.key());
                e.insert(CacheEntry {
                    payload: payload.clone(),
                    stamped: Instant::now(),
                });
                if let Some(sender) = self.delivery_sender.lock().await.as_ref() {
                    // the receiver lives as long as the cache
                    let _ = sender.send(payload);
                }
                true
            }
        }
    }

    /// Stores a payload without delivering it, e.g. for payloads sent locally
    pub async fn retain(&self, key: DeliveryKey, payload: Bytes) {
        self.entries.write().await
            .insert(key, CacheEntry {
                payload,
                stamped: Instant::now(),
            });
    }

    /// returns the payload and the time it was last received or repaired
    pub async fn get(&self, key: &DeliveryKey) -> Option<(Bytes, Instant)> {
        self.entries.read().await
            .get(key)
            .map(|e| (e.payload.clone(), e.stamped))
    }

    /// records that the payload was just repaired
    pub async fn stamp(&self, key: &DeliveryKey) {
        if let Some(entry) = self.entries.write().await.get_mut(key) {
            entry.stamped = Instant::now();
        }
    }

    /// Waits for the next undelivered payload, in order of arrival. Fails with
    ///  [ReceiveCancelled] after the cache was closed and all queued payloads were consumed.
    pub async fn consume(&self) -> anyhow::Result<Bytes> {
        let mut receiver = self.delivery_receiver.lock().await;
        match receiver.recv().await {
            Some(payload) => Ok(payload),
            None => Err(ReceiveCancelled.into()),
        }
    }

    /// wakes up consumers waiting for a payload
    pub async fn close(&self) {
        debug!("closing delivery queue");
        self.delivery_sender.lock().await.take();
    }

    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let len_before = entries.len();
        entries.retain(|_, e| now.duration_since(e.stamped) < self.retention);
        len_before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// The periodic eviction sweep, running until `shutdown` changes
    pub async fn run_eviction(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = interval(self.eviction_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticks.tick() => {
                    let num_evicted = self.evict_expired().await;
                    if num_evicted > 0 {
                        debug!("evicted {} expired payloads from the cache, {} remaining", num_evicted, self.len().await);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("stopping cache eviction");
                    break;
                }
            }
        }
    }
}
