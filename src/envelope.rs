//! Wire format
//!
//! Every datagram carries exactly one envelope, serialized as a JSON object:
//!
//! ```json
//! {"sequence": 7, "from": "10.0.0.5@5000@4711", "type": "DATA", "body": [104, 105]}
//! ```
//!
//! `type` is the single discriminant that decides how `body` is interpreted; it is read once,
//!  and an envelope whose body does not match its `type` is rejected as a whole.
//!
//! For DATA, `sequence` is the per-sender sequence number of the payload, starting at 1. For all
//!  other types, it is the sender's *next* DATA sequence number at the time of sending, i.e. it
//!  advertises how many payloads the sender has emitted so far.

use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;
use anyhow::bail;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of a process + endpoint taking part in a group: `address@port@process`
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(address: IpAddr, port: u16, process_id: u32) -> MemberId {
        MemberId(format!("{}@{}@{}", address, port, process_id))
    }
}

impl From<&str> for MemberId {
    fn from(value: &str) -> Self {
        MemberId(value.to_string())
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a single payload across the group: sender identity plus the sender's sequence
///  number for it
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub member: MemberId,
    pub sequence: u64,
}

impl DeliveryKey {
    pub fn new(member: MemberId, sequence: u64) -> DeliveryKey {
        DeliveryKey { member, sequence }
    }
}

impl Debug for DeliveryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}-{}>", self.member, self.sequence)
    }
}

impl Display for DeliveryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.member, self.sequence)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence: u64,
    pub from: MemberId,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeBody {
    Session(SessionBody),
    Data(Bytes),
    Request(RequestBody),
    Repair(RepairBody),
}

impl EnvelopeBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::Session(_) => "SESSION",
            EnvelopeBody::Data(_) => "DATA",
            EnvelopeBody::Request(_) => "REQUEST",
            EnvelopeBody::Repair(_) => "REPAIR",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionBody {
    /// milliseconds on the advertiser's local clock - only ever compared by the advertiser
    ///  itself when it is echoed back, so clocks need not be synchronized
    pub timestamp_millis: u64,
    pub view: BTreeSet<MemberId>,
    #[serde(default)]
    pub echoes: Vec<TimestampEcho>,
}

/// Echo of the last session timestamp received from `member`, and how long it was held before
///  being sent back. This is what distance estimation is based on.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TimestampEcho {
    pub member: MemberId,
    pub timestamp_millis: u64,
    pub held_millis: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestBody {
    pub key: DeliveryKey,
    /// the requester's distance to the payload's source, if known
    pub distance_millis: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepairBody {
    pub key: DeliveryKey,
    pub payload: Bytes,
}

impl Envelope {
    pub fn ser(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<Envelope> {
        let envelope: Envelope = serde_json::from_slice(buf)?;
        if let EnvelopeBody::Data(_) = &envelope.body {
            if envelope.sequence == 0 {
                bail!("DATA from {} with sequence number 0", envelope.from);
            }
        }
        Ok(envelope)
    }

    /// The delivery key of a DATA envelope's payload
    pub fn data_key(&self) -> Option<DeliveryKey> {
        match &self.body {
            EnvelopeBody::Data(_) => Some(DeliveryKey::new(self.from.clone(), self.sequence)),
            _ => None,
        }
    }
}
