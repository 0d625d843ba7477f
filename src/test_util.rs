//! Helpers for testing code that uses reliable multicast without a network. This is not
//!  restricted to `cfg(test)` so that applications can use it in their own tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub mod multicast_hub;

/// convenience method for test code: create a member address based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_member_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), number))
}
