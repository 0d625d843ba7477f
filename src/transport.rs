use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};
use crate::config::SrmConfig;

/// The unreliable, connectionless multicast transport that the protocol is built on. This is
///  an abstraction to allow running the protocol on top of an in-memory network for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MulticastTransport: Send + Sync + 'static {
    /// send a single datagram to the group
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// receive a single datagram from the group, returning its length
    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize>;

    /// whether datagrams sent through this transport are delivered back to it
    fn is_loopback_enabled(&self) -> bool;

    /// the local endpoint, used for deriving the member's identity
    fn local_addr(&self) -> SocketAddr;

    async fn leave_group(&self) -> anyhow::Result<()>;
}

pub struct UdpMulticastTransport {
    socket: UdpSocket,
    group: SocketAddr,
    local_addr: SocketAddr,
    configured_loop: bool,
}

impl UdpMulticastTransport {
    /// Binds a socket to the group's port and joins the group on the default interface
    pub fn join(group: SocketAddr, config: &SrmConfig) -> anyhow::Result<UdpMulticastTransport> {
        if !group.ip().is_multicast() {
            bail!("{} is not a multicast address", group.ip());
        }

        let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr: SocketAddr = match group.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, group.port()).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, group.port()).into(),
        };
        socket.bind(&bind_addr.into())?;

        match group.ip() {
            IpAddr::V4(ip) => {
                socket.join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)?;
                socket.set_multicast_loop_v4(config.multicast_loop)?;
                socket.set_multicast_ttl_v4(config.multicast_ttl)?;
            }
            IpAddr::V6(ip) => {
                socket.join_multicast_v6(&ip, 0)?;
                socket.set_multicast_loop_v6(config.multicast_loop)?;
                socket.set_multicast_hops_v6(config.multicast_ttl)?;
            }
        }

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = SocketAddr::new(Self::probe_local_ip(group), socket.local_addr()?.port());
        info!("joined multicast group {:?} as {:?}", group, local_addr);

        Ok(UdpMulticastTransport {
            socket,
            group,
            local_addr,
            configured_loop: config.multicast_loop,
        })
    }

    /// The socket is bound to the wildcard address, so the address that identifies this node is
    ///  determined by asking the OS which local address it would route traffic to the group
    ///  from. Connecting a UDP socket does not send anything.
    fn probe_local_ip(group: SocketAddr) -> IpAddr {
        let unspecified: SocketAddr = match group.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let probed = std::net::UdpSocket::bind(unspecified)
            .and_then(|s| s.connect(group).map(|_| s))
            .and_then(|s| s.local_addr());

        match probed {
            Ok(addr) => addr.ip(),
            Err(e) => {
                warn!("cannot determine local address for {:?}, falling back to {:?}: {}", group, unspecified.ip(), e);
                unspecified.ip()
            }
        }
    }
}

#[async_trait]
impl MulticastTransport for UdpMulticastTransport {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("UDP multicast: sending {} bytes to {:?}", buf.len(), self.group);
        self.socket.send_to(buf, self.group).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let (num_read, from) = self.socket.recv_from(buf).await?;
        trace!("UDP multicast: received {} bytes from {:?}", num_read, from);
        Ok(num_read)
    }

    fn is_loopback_enabled(&self) -> bool {
        let queried = match self.group {
            SocketAddr::V4(_) => self.socket.multicast_loop_v4(),
            SocketAddr::V6(_) => self.socket.multicast_loop_v6(),
        };
        queried.unwrap_or_else(|e| {
            debug!("cannot query multicast loop option, assuming configured value {}: {}", self.configured_loop, e);
            self.configured_loop
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn leave_group(&self) -> anyhow::Result<()> {
        match self.group.ip() {
            IpAddr::V4(ip) => self.socket.leave_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(ip) => self.socket.leave_multicast_v6(&ip, 0)?,
        }
        info!("left multicast group {:?}", self.group);
        Ok(())
    }
}
