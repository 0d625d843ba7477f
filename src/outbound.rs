use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::trace;
use crate::envelope::{DeliveryKey, Envelope, EnvelopeBody, MemberId};
use crate::transport::MulticastTransport;

/// Byte counters for the self-tuning of the session advertisement rate. Both counters are reset
///  whenever the advertisement interval is recalculated.
#[derive(Default, Debug)]
pub struct BandwidthMeter {
    aggregate: AtomicU64,
    session: AtomicU64,
}

impl BandwidthMeter {
    pub fn add_aggregate(&self, num_bytes: usize) {
        self.aggregate.fetch_add(num_bytes as u64, Ordering::AcqRel);
    }

    pub fn add_session(&self, num_bytes: usize) {
        self.session.fetch_add(num_bytes as u64, Ordering::AcqRel);
    }

    /// returns `(session, aggregate)` and resets both counters
    pub fn take(&self) -> (u64, u64) {
        (
            self.session.swap(0, Ordering::AcqRel),
            self.aggregate.swap(0, Ordering::AcqRel),
        )
    }
}

/// The transmit path that all parts of the protocol share: it stamps envelopes with the local
///  identity and sequence number, enforces the datagram size limit and accounts bandwidth.
pub struct Outbound {
    transport: Arc<dyn MulticastTransport>,
    self_id: MemberId,
    bandwidth: BandwidthMeter,
    max_datagram_size: usize,
    next_sequence: AtomicU64,
    /// DATA sends are serialized to give a single total order of the local sequence numbers
    data_lock: Mutex<()>,
}

impl Outbound {
    pub fn new(transport: Arc<dyn MulticastTransport>, self_id: MemberId, max_datagram_size: usize) -> Outbound {
        Outbound {
            transport,
            self_id,
            bandwidth: Default::default(),
            max_datagram_size,
            next_sequence: AtomicU64::new(1),
            data_lock: Mutex::new(()),
        }
    }

    pub fn self_id(&self) -> &MemberId {
        &self.self_id
    }

    pub fn bandwidth(&self) -> &BandwidthMeter {
        &self.bandwidth
    }

    /// the sequence number that the next DATA envelope will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Acquire)
    }

    pub fn is_loopback_enabled(&self) -> bool {
        self.transport.is_loopback_enabled()
    }

    /// Sends a payload as DATA, returning its delivery key. The sequence number is consumed
    ///  only if the datagram was handed to the transport successfully.
    pub async fn send_data(&self, payload: Bytes) -> anyhow::Result<DeliveryKey> {
        let _guard = self.data_lock.lock().await;

        let sequence = self.next_sequence();
        let envelope = Envelope {
            sequence,
            from: self.self_id.clone(),
            body: EnvelopeBody::Data(payload),
        };
        self.transmit(&envelope).await?;
        self.next_sequence.store(sequence + 1, Ordering::Release);

        Ok(DeliveryKey::new(self.self_id.clone(), sequence))
    }

    /// Sends a SESSION, REQUEST or REPAIR envelope, returning the number of bytes sent. These
    ///  carry the next DATA sequence number to advertise the local progress.
    pub async fn send_control(&self, body: EnvelopeBody) -> anyhow::Result<usize> {
        let envelope = Envelope {
            sequence: self.next_sequence(),
            from: self.self_id.clone(),
            body,
        };
        self.transmit(&envelope).await
    }

    async fn transmit(&self, envelope: &Envelope) -> anyhow::Result<usize> {
        let buf = envelope.ser()?;
        if buf.len() > self.max_datagram_size {
            bail!("{} envelope has {} bytes, exceeding the maximum datagram size of {}", envelope.body.kind(), buf.len(), self.max_datagram_size);
        }

        trace!("multicasting {} #{} ({} bytes)", envelope.body.kind(), envelope.sequence, buf.len());
        self.transport.send(&buf).await?;
        self.bandwidth.add_aggregate(buf.len());
        Ok(buf.len())
    }
}
