use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use crate::backoff::BackoffPool;
use crate::config::SrmConfig;
use crate::delivery_cache::DeliveryCache;
use crate::dispatcher::Dispatcher;
use crate::envelope::MemberId;
use crate::membership::{MembershipTable, Observation};
use crate::outbound::Outbound;
use crate::session::{SessionAdvertiser, SessionClock};
use crate::transport::{MulticastTransport, UdpMulticastTransport};
use crate::util::random::RngRandom;

/// Everything that exists only while a group is joined
struct JoinedGroup {
    outbound: Arc<Outbound>,
    membership: Arc<MembershipTable>,
    cache: Arc<DeliveryCache>,
    backoff: Arc<BackoffPool<RngRandom>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A socket for reliable multicast: every payload sent by a member is delivered to every other
///  member of the group exactly once (as long as members stay in the group), in the order in which
///  it was sent. There is no ordering guarantee between payloads of different senders.
///
/// A socket can join one group at a time. It can join again after leaving.
pub struct ReliableSocket {
    config: Arc<SrmConfig>,
    group: RwLock<Option<Arc<JoinedGroup>>>,
}

impl ReliableSocket {
    pub fn new(config: SrmConfig) -> anyhow::Result<ReliableSocket> {
        config.validate()?;
        Ok(ReliableSocket {
            config: Arc::new(config),
            group: Default::default(),
        })
    }

    /// Joins a multicast group on the default interface. Failing to bind or join is reported
    ///  as an error.
    pub async fn join(&self, group: SocketAddr) -> anyhow::Result<()> {
        let transport = UdpMulticastTransport::join(group, &self.config)?;
        self.join_with_transport(Arc::new(transport)).await
    }

    /// Joins the group that a transport is connected to
    pub async fn join_with_transport(&self, transport: Arc<dyn MulticastTransport>) -> anyhow::Result<()> {
        let mut group = self.group.write().await;
        if group.is_some() {
            bail!("already joined a group - leave it first");
        }

        let local_addr = transport.local_addr();
        let self_id = MemberId::new(local_addr.ip(), local_addr.port(), std::process::id());

        let outbound = Arc::new(Outbound::new(transport.clone(), self_id.clone(), self.config.max_datagram_size));
        let membership = Arc::new(MembershipTable::new(self.config.clone()));
        let cache = Arc::new(DeliveryCache::new(self.config.cache_retention, self.config.eviction_interval));
        let backoff = Arc::new(BackoffPool::new(self.config.clone(), outbound.clone(), membership.clone(), cache.clone()));
        let clock = SessionClock::new();
        let (shutdown, shutdown_receiver) = watch::channel(false);

        let dispatcher = Dispatcher::new(transport, outbound.clone(), membership.clone(), cache.clone(), backoff.clone(), clock);
        let advertiser = SessionAdvertiser::new(self.config.clone(), outbound.clone(), membership.clone(), clock);

        let mut tasks = Vec::new();
        let shutdown_dispatcher = shutdown_receiver.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(shutdown_dispatcher).await }));
        let shutdown_advertiser = shutdown_receiver.clone();
        tasks.push(tokio::spawn(async move { advertiser.run(shutdown_advertiser).await }));
        let eviction_cache = cache.clone();
        tasks.push(tokio::spawn(async move { eviction_cache.run_eviction(shutdown_receiver).await }));

        info!("joined multicast group as {:?}", self_id);
        *group = Some(Arc::new(JoinedGroup {
            outbound,
            membership,
            cache,
            backoff,
            shutdown,
            tasks: Mutex::new(tasks),
        }));
        Ok(())
    }

    /// Leaves the group, terminating all background activity. A pending [ReliableSocket::receive]
    ///  fails with [crate::ReceiveCancelled]. Leaving when no group is joined does nothing.
    pub async fn leave(&self) -> anyhow::Result<()> {
        let joined = match self.group.write().await.take() {
            Some(joined) => joined,
            None => return Ok(()),
        };
        info!("leaving multicast group as {:?}", joined.outbound.self_id());

        joined.shutdown.send_replace(true);
        joined.backoff.close().await;

        let tasks = std::mem::take(&mut *joined.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("background task terminated abnormally: {}", e);
            }
        }

        joined.cache.close().await;
        Ok(())
    }

    async fn joined(&self) -> anyhow::Result<Arc<JoinedGroup>> {
        match self.group.read().await.as_ref() {
            Some(joined) => Ok(joined.clone()),
            None => bail!("not joined to a multicast group"),
        }
    }

    /// Multicasts a payload to the group. The payload is not delivered locally.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        let joined = self.joined().await?;

        let key = joined.outbound.send_data(payload.clone()).await?;
        joined.cache.retain(key.clone(), payload).await;

        if !joined.outbound.is_loopback_enabled() {
            // the dispatcher does not see our own DATA in this case
            joined.membership.update(&key.member, Observation::Data(key.sequence), None).await;
        }
        Ok(())
    }

    /// Waits for the next payload from any other member
    pub async fn receive(&self) -> anyhow::Result<Bytes> {
        let joined = self.joined().await?;
        joined.cache.consume().await
    }

    pub async fn is_joined(&self) -> bool {
        self.group.read().await.is_some()
    }

    pub async fn self_id(&self) -> Option<MemberId> {
        self.group.read().await
            .as_ref()
            .map(|joined| joined.outbound.self_id().clone())
    }

    /// This member and all members that were observed in the currently joined group, i.e. the
    ///  view that is advertised in SESSIONs
    pub async fn view(&self) -> BTreeSet<MemberId> {
        match self.joined().await {
            Ok(joined) => {
                let mut view = joined.membership.current_view().await;
                view.insert(joined.outbound.self_id().clone());
                view
            }
            Err(_) => Default::default(),
        }
    }
}
