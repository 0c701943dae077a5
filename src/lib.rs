//! # Link Observer - link health-check agent
//!
//! Periodically verifies that a network link is usable the way a client
//! would use it: it obtains DHCPv4 and DHCPv6 leases (briefly claiming the
//! leased addresses on the interface), asks DNS resolvers for a timestamped
//! TXT record and pings a set of targets. Every result ends up in Prometheus
//! metrics.
//!
//! ## Example
//!
//! ```rust,no_run
//! use link_observer::{
//!     dns::{DnsProbe, UdpDnsClient},
//!     icmp::{IcmpProbe, RawPinger},
//!     network::address::IpCommand,
//!     v4::{Dhcp4Probe, DhcpV4Client},
//!     ObserverConfig, ObserverMetrics, Observer,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(config: ObserverConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = ObserverMetrics::new()?;
//! let dns = DnsProbe::new(
//!     UdpDnsClient::new(config.dns_timeout),
//!     config.dns_targets.clone(),
//!     config.dns_qname.clone(),
//!     config.dns_failure_policy,
//!     metrics.dns.clone(),
//! );
//! let icmp = IcmpProbe::new(
//!     RawPinger::default(),
//!     config.icmp_targets.clone(),
//!     config.icmp_count,
//!     config.resolve_family(),
//!     metrics.icmp.clone(),
//! );
//! let observer = Observer::new(
//!     config.interface.clone(),
//!     config.interval,
//!     Arc::new(IpCommand::default()),
//!     Box::new(dns),
//!     Box::new(icmp),
//! )
//! .with_lease_probe(Box::new(Dhcp4Probe::new(
//!     DhcpV4Client::new(config.dhcp_v4()),
//!     metrics.dhcp4.clone(),
//!     config.verbose,
//! )));
//! observer.run().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod icmp;
pub mod metrics;
pub mod metrics_server;
pub mod network;
pub mod observer;
pub mod v4;
pub mod v6;

pub use client::{Handshake, HandshakeDriver, Lease};
pub use config::{Args, ClientConfig, DnsFailurePolicy, ObserverConfig, ResolveFamily};
pub use error::{FailureKind, ObserverError, ProbeError};
pub use metrics::ObserverMetrics;
pub use observer::{LeaseProbe, Observer, Phase, Probe};
