//! DHCPv4 protocol implementation
//!
//! This module contains the DHCPv4-specific implementation including:
//! - Message construction and parsing
//! - State machine handling
//! - The lease probe driving one handshake per sampling pass

pub mod handler;
pub mod message;
pub mod probe;

pub use handler::DhcpV4Handler;
pub use message::{build_dhcp_discover, build_dhcp_request};
pub use probe::{Dhcp4Probe, DhcpV4Client, DhcpV4Exchange};
