//! DHCPv6 protocol implementation
//!
//! Mirrors the DHCPv4 module: message construction, the client state
//! machine and the lease probe. The terminal message is REPLY and leases
//! are claimed as /128 host addresses.

pub mod handler;
pub mod message;
pub mod probe;

pub use handler::DhcpV6Handler;
pub use probe::{Dhcp6Probe, DhcpV6Client, DhcpV6Exchange, DHCPV6_PREFIX_LEN};
