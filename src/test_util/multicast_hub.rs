use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::trace;
use crate::envelope::{DeliveryKey, Envelope};
use crate::transport::MulticastTransport;

/// A datagram as it was sent through the hub
#[derive(Clone, Debug)]
pub struct HubRecord {
    pub at: Instant,
    pub from: SocketAddr,
    /// `None` if the datagram is not a valid envelope
    pub envelope: Option<Envelope>,
}

struct DataLoss {
    key: DeliveryKey,
    /// `None` for all receivers
    to: Option<SocketAddr>,
}

/// An in-memory multicast group with instant delivery and selective loss, for testing
///  applications (and this crate) without a network
#[derive(Default)]
pub struct MulticastHub {
    members: RwLock<FxHashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
    losses: RwLock<Vec<DataLoss>>,
    records: RwLock<Vec<HubRecord>>,
}

impl MulticastHub {
    pub fn new() -> Arc<MulticastHub> {
        Default::default()
    }

    pub async fn join(self: &Arc<Self>, addr: SocketAddr, loopback: bool) -> HubTransport {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.members.write().await
            .insert(addr, sender);

        HubTransport {
            hub: self.clone(),
            addr,
            loopback,
            receiver: Mutex::new(receiver),
        }
    }

    /// DATA envelopes with the given key are not delivered to `to` (or any member for `None`).
    ///  This does not affect REPAIRs of the same payload.
    pub async fn drop_data(&self, key: DeliveryKey, to: Option<SocketAddr>) {
        self.losses.write().await
            .push(DataLoss { key, to });
    }

    /// All datagrams sent through the hub so far, in the order they were sent
    pub async fn records(&self) -> Vec<HubRecord> {
        self.records.read().await.clone()
    }

    async fn is_lost(&self, to: SocketAddr, envelope: Option<&Envelope>) -> bool {
        let key = match envelope.and_then(|e| e.data_key()) {
            Some(key) => key,
            None => return false,
        };
        self.losses.read().await
            .iter()
            .any(|l| l.key == key && l.to.map(|addr| addr == to).unwrap_or(true))
    }

    async fn multicast(&self, from: SocketAddr, buf: &[u8], loopback: bool) {
        let envelope = Envelope::deser(buf).ok();
        self.records.write().await
            .push(HubRecord {
                at: Instant::now(),
                from,
                envelope: envelope.clone(),
            });

        let members = self.members.read().await;
        for (&to, sender) in members.iter() {
            if to == from && !loopback {
                continue;
            }
            if self.is_lost(to, envelope.as_ref()).await {
                trace!("hub: dropping datagram from {:?} to {:?}", from, to);
                continue;
            }
            // the receiver may have left concurrently
            let _ = sender.send(buf.to_vec());
        }
    }
}

pub struct HubTransport {
    hub: Arc<MulticastHub>,
    addr: SocketAddr,
    loopback: bool,
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl MulticastTransport for HubTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.hub.multicast(self.addr, buf, self.loopback).await;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let datagram = self.receiver.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("{:?} is not connected to the hub", self.addr))?;

        // like UDP, excess bytes are discarded
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    fn is_loopback_enabled(&self) -> bool {
        self.loopback
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn leave_group(&self) -> anyhow::Result<()> {
        self.hub.members.write().await
            .remove(&self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBody, MemberId};
    use crate::test_util::test_member_addr;
    use bytes::Bytes;

    fn data(from: &str, sequence: u64) -> Vec<u8> {
        Envelope {
            sequence,
            from: MemberId::from(from),
            body: EnvelopeBody::Data(Bytes::from_static(b"x")),
        }.ser().unwrap()
    }

    #[tokio::test]
    async fn test_multicast_with_loss() {
        let hub = MulticastHub::new();
        let a = hub.join(test_member_addr(1), true).await;
        let b = hub.join(test_member_addr(2), false).await;
        let c = hub.join(test_member_addr(3), true).await;

        hub.drop_data(DeliveryKey::new(MemberId::from("a"), 2), Some(test_member_addr(3))).await;

        a.send(&data("a", 1)).await.unwrap();
        a.send(&data("a", 2)).await.unwrap();
        b.send(b"not an envelope").await.unwrap();

        let mut buf = [0u8; 1000];
        let len = c.recv(&mut buf).await.unwrap();
        assert_eq!(Envelope::deser(&buf[..len]).unwrap().sequence, 1);
        let len = c.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"not an envelope");

        // loopback
        for sequence in [1, 2] {
            let len = a.recv(&mut buf).await.unwrap();
            assert_eq!(Envelope::deser(&buf[..len]).unwrap().sequence, sequence);
        }

        let records = hub.records().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].from, test_member_addr(2));
        assert!(records[2].envelope.is_none());

        b.leave_group().await.unwrap();
        a.send(&data("a", 3)).await.unwrap();
        assert!(b.recv(&mut buf).await.is_ok());
        assert!(b.recv(&mut buf).await.is_ok());
        assert!(b.recv(&mut buf).await.is_err());
    }
}
