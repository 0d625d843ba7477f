//! Reliable multicast on top of UDP, based on Scalable Reliable Multicast (SRM).
//!
//! Every member of a group multicasts its payloads as DATA with per-sender sequence numbers.
//!  Receivers detect gaps in these sequences and multicast a REQUEST after a randomized backoff,
//!  and any member holding the payload answers with a REPAIR after a randomized backoff of its own.
//!  Both backoffs are scaled by the estimated network distance to the payload's source, so that
//!  in most cases a single REQUEST and a single REPAIR are sent per loss, regardless of group size.
//!  Distances are estimated from timestamps echoed in periodic SESSION advertisements.
//!
//! The application-facing API is [ReliableSocket].

pub mod backoff;
pub mod config;
pub mod delivery_cache;
pub mod dispatcher;
pub mod envelope;
pub mod membership;
pub mod outbound;
pub mod session;
pub mod socket;
pub mod transport;
pub mod util;
pub mod test_util;

pub use config::SrmConfig;
pub use delivery_cache::ReceiveCancelled;
pub use envelope::{DeliveryKey, MemberId};
pub use socket::ReliableSocket;
pub use transport::{MulticastTransport, UdpMulticastTransport};


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
