use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::SrmConfig;
use crate::envelope::{MemberId, TimestampEcho};

/// A snapshot of what is known about a member
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub member: MemberId,
    pub last_seen: Instant,
    /// estimated one-way latency, `None` until a round trip was observed or a hint received
    pub distance: Option<Duration>,
    /// the highest sequence number that this member is known to have sent. This is `None`
    ///  until an envelope carrying sequence information was received from the member.
    pub highest_sequence: Option<u64>,
    /// sequence numbers up to `highest_sequence` whose payload did not arrive (yet)
    pub missing: BTreeSet<u64>,
}

/// What an envelope tells about its sender
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Observation {
    /// the payload with this sequence number arrived
    Data(u64),
    /// the sender advertised its next sequence number
    Progress { next_sequence: u64 },
    /// the member is known to exist, without any information about its sequence numbers
    Contact,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SequenceUpdate {
    /// The payload was not seen before. `missing` are the sequence numbers that were
    ///  discovered to be missing with this observation.
    Fresh { missing: Vec<u64> },
    Duplicate,
    /// no payload was observed, but `missing` sequence numbers were discovered
    Progress { missing: Vec<u64> },
}

struct MemberState {
    entry: Entry,
    /// timestamp of the last SESSION received from this member, and when it was received
    last_session: Option<(u64, Instant)>,
}

impl MemberState {
    fn new(member: MemberId) -> MemberState {
        MemberState {
            entry: Entry {
                member,
                last_seen: Instant::now(),
                distance: None,
                highest_sequence: None,
                missing: Default::default(),
            },
            last_session: None,
        }
    }

    fn fold_distance(&mut self, sample: Duration, new_weight: f64) {
        let folded = match self.entry.distance {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - new_weight) + sample.mul_f64(new_weight),
        };
        trace!("distance to {:?}: sample {:?}, moving avg {:?}", self.entry.member, sample, folded);
        self.entry.distance = Some(folded);
    }

    /// registers all sequence numbers after the current high-water mark up to and including
    ///  `up_to` as missing. Sequence numbers start at 1, so on the first sighting of a member
    ///  everything it sent before is missing.
    fn extend_to(&mut self, up_to: u64, max_gap: u64) -> Vec<u64> {
        let highest = *self.entry.highest_sequence.get_or_insert(0);
        if up_to <= highest {
            return vec![];
        }

        let mut from = highest + 1;
        if up_to - highest > max_gap {
            warn!("{:?} jumped from sequence #{} to #{} - recovering only the last {}", self.entry.member, highest, up_to, max_gap);
            from = up_to - max_gap + 1;
        }

        self.entry.highest_sequence = Some(up_to);
        let missing = (from..=up_to).collect::<Vec<_>>();
        self.entry.missing.extend(missing.iter().copied());
        missing
    }

    fn observe(&mut self, observation: Observation, max_gap: u64) -> SequenceUpdate {
        match observation {
            Observation::Contact => SequenceUpdate::Progress { missing: vec![] },
            Observation::Progress { next_sequence } => {
                let missing = self.extend_to(next_sequence.saturating_sub(1), max_gap);
                SequenceUpdate::Progress { missing }
            }
            Observation::Data(sequence) => {
                if self.entry.missing.remove(&sequence) {
                    return SequenceUpdate::Fresh { missing: vec![] };
                }
                match self.entry.highest_sequence {
                    Some(highest) if sequence <= highest => SequenceUpdate::Duplicate,
                    _ => {
                        let mut missing = self.extend_to(sequence, max_gap);
                        // the payload itself is not missing, it just arrived
                        missing.retain(|s| *s != sequence);
                        self.entry.missing.remove(&sequence);
                        SequenceUpdate::Fresh { missing }
                    }
                }
            }
        }
    }
}

/// This is the ledger of all members ever observed in the group, with their liveness, their
///  sequence numbers (for loss detection and at-most-once delivery) and the estimated distance.
///
/// The map itself is read-mostly, with a separate lock per member so that updates for different
///  members do not serialize.
pub struct MembershipTable {
    config: Arc<SrmConfig>,
    members: RwLock<FxHashMap<MemberId, Arc<Mutex<MemberState>>>>,
}

impl MembershipTable {
    pub fn new(config: Arc<SrmConfig>) -> MembershipTable {
        MembershipTable {
            config,
            members: Default::default(),
        }
    }

    async fn get_state(&self, member: &MemberId) -> Option<Arc<Mutex<MemberState>>> {
        self.members.read().await
            .get(member)
            .cloned()
    }

    async fn get_or_create_state(&self, member: &MemberId) -> Arc<Mutex<MemberState>> {
        if let Some(state) = self.get_state(member).await {
            return state;
        }

        let mut members = self.members.write().await;
        // check again now that we have the exclusive lock
        members.entry(member.clone())
            .or_insert_with(|| {
                debug!("new member {:?}", member);
                Arc::new(Mutex::new(MemberState::new(member.clone())))
            })
            .clone()
    }

    pub async fn get(&self, member: &MemberId) -> Option<Entry> {
        match self.get_state(member).await {
            Some(state) => Some(state.lock().await.entry.clone()),
            None => None,
        }
    }

    pub async fn is_known(&self, member: &MemberId) -> bool {
        self.members.read().await
            .contains_key(member)
    }

    pub async fn distance(&self, member: &MemberId) -> Option<Duration> {
        match self.get_state(member).await {
            Some(state) => state.lock().await.entry.distance,
            None => None,
        }
    }

    /// Merges an observation of a member, refreshing its last-seen time. A distance hint is
    ///  folded into the moving average of the distance estimate.
    pub async fn update(&self, member: &MemberId, observation: Observation, distance_hint: Option<Duration>) -> SequenceUpdate {
        let state = self.get_or_create_state(member).await;
        let mut state = state.lock().await;

        state.entry.last_seen = Instant::now();
        if let Some(sample) = distance_hint {
            state.fold_distance(sample, self.config.distance_moving_avg_new_weight);
        }
        state.observe(observation, self.config.max_recovery_gap)
    }

    /// Sets a member's distance if no estimate exists yet
    pub async fn seed_distance(&self, member: &MemberId, hint: Duration) {
        let state = self.get_or_create_state(member).await;
        let mut state = state.lock().await;
        if state.entry.distance.is_none() {
            debug!("seeding distance to {:?} with {:?}", member, hint);
            state.entry.distance = Some(hint);
        }
    }

    pub async fn record_session(&self, member: &MemberId, timestamp_millis: u64) {
        let state = self.get_or_create_state(member).await;
        state.lock().await.last_session = Some((timestamp_millis, Instant::now()));
    }

    /// echoes of the last session timestamp received from each member, for inclusion in the
    ///  next local SESSION
    pub async fn echoes(&self) -> Vec<TimestampEcho> {
        let states = self.members.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let now = Instant::now();
        let mut result = Vec::new();
        for state in states {
            let state = state.lock().await;
            if let Some((timestamp_millis, received)) = state.last_session {
                result.push(TimestampEcho {
                    member: state.entry.member.clone(),
                    timestamp_millis,
                    held_millis: now.duration_since(received).as_millis() as u64,
                });
            }
        }
        result.sort_by(|a, b| a.member.cmp(&b.member));
        result
    }

    pub async fn current_view(&self) -> BTreeSet<MemberId> {
        self.members.read().await
            .keys()
            .cloned()
            .collect()
    }
}
