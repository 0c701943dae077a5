//! Prometheus metrics for the probes
//!
//! The sink is built once at startup and handed to every probe; each probe
//! owns a clone of its own metric group. All time-valued gauges are seconds.

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub const RESOLVER_LABEL: &str = "resolver";
pub const TARGET_LABEL: &str = "target";
pub const ADDRESS_LABEL: &str = "address";

#[derive(Clone)]
pub struct Dhcp4Metrics {
    pub requests: IntCounter,
    pub offers: IntCounter,
    pub failures: IntCounter,
    pub latency: Gauge,
    pub lease_time: Gauge,
}

#[derive(Clone)]
pub struct Dhcp6Metrics {
    pub requests: IntCounter,
    pub offers: IntCounter,
    pub replies: IntCounter,
    pub failures: IntCounter,
    pub latency: Gauge,
    pub lifetime: Gauge,
}

/// DNS metrics, labelled by `resolver`.
#[derive(Clone)]
pub struct DnsMetrics {
    pub requests: IntCounterVec,
    pub failures: IntCounterVec,
    pub parse_failures: IntCounterVec,
    pub rtt: GaugeVec,
    pub age: GaugeVec,
}

/// ICMP metrics. Request and failure counts are labelled by `target`,
/// measurements by `target` and the resolved `address`.
#[derive(Clone)]
pub struct IcmpMetrics {
    pub requests: IntCounterVec,
    pub failures: IntCounterVec,
    pub sent: IntCounterVec,
    pub received: IntCounterVec,
    pub rtt: GaugeVec,
}

/// The agent's metrics sink.
#[derive(Clone)]
pub struct ObserverMetrics {
    pub dhcp4: Dhcp4Metrics,
    pub dhcp6: Dhcp6Metrics,
    pub dns: DnsMetrics,
    pub icmp: IcmpMetrics,
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec, prometheus::Error> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ObserverMetrics {
    /// Creates all metrics on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dhcp4 = Dhcp4Metrics {
            requests: counter(
                &registry,
                "observer_dhcp_requests",
                "Total number of sent DHCPv4 requests",
            )?,
            offers: counter(
                &registry,
                "observer_dhcp_offers",
                "Total number of received DHCPv4 offers",
            )?,
            failures: counter(
                &registry,
                "observer_dhcp_failures",
                "Total number of failed DHCPv4 handshakes",
            )?,
            latency: gauge(
                &registry,
                "observer_dhcp_latency",
                "Seconds between DHCPv4 discover and the first reply",
            )?,
            lease_time: gauge(
                &registry,
                "observer_dhcp_lease_time",
                "DHCPv4 lease time in seconds",
            )?,
        };

        let dhcp6 = Dhcp6Metrics {
            requests: counter(
                &registry,
                "observer_dhcp6_requests",
                "Total number of sent DHCPv6 requests",
            )?,
            offers: counter(
                &registry,
                "observer_dhcp6_offers",
                "Total number of received DHCPv6 advertisements",
            )?,
            replies: counter(
                &registry,
                "observer_dhcp6_replies",
                "Total number of received DHCPv6 replies",
            )?,
            failures: counter(
                &registry,
                "observer_dhcp6_failures",
                "Total number of failed DHCPv6 handshakes",
            )?,
            latency: gauge(
                &registry,
                "observer_dhcp6_latency",
                "Seconds between DHCPv6 solicit and the first reply",
            )?,
            lifetime: gauge(
                &registry,
                "observer_dhcp6_lifetime",
                "Valid lifetime in seconds of the DHCPv6 obtained address",
            )?,
        };

        let dns = DnsMetrics {
            requests: counter_vec(
                &registry,
                "observer_dns_requests",
                "Total number of sent DNS requests",
                &[RESOLVER_LABEL],
            )?,
            failures: counter_vec(
                &registry,
                "observer_dns_failures",
                "Total number of failed DNS requests",
                &[RESOLVER_LABEL],
            )?,
            parse_failures: counter_vec(
                &registry,
                "observer_dns_parse_failures",
                "Total number of DNS answers without a numeric timestamp",
                &[RESOLVER_LABEL],
            )?,
            rtt: gauge_vec(
                &registry,
                "observer_dns_rtt",
                "Round trip time of the DNS request in seconds",
                &[RESOLVER_LABEL],
            )?,
            age: gauge_vec(
                &registry,
                "observer_dns_age",
                "Seconds since the timestamp published in the healthcheck record",
                &[RESOLVER_LABEL],
            )?,
        };

        let icmp = IcmpMetrics {
            requests: counter_vec(
                &registry,
                "observer_icmp_requests",
                "Total number of sent ICMP requests",
                &[TARGET_LABEL],
            )?,
            failures: counter_vec(
                &registry,
                "observer_icmp_failures",
                "Total number of failed ICMP measurements",
                &[TARGET_LABEL],
            )?,
            sent: counter_vec(
                &registry,
                "observer_icmp_sent",
                "Total number of ICMP echo requests sent",
                &[TARGET_LABEL, ADDRESS_LABEL],
            )?,
            received: counter_vec(
                &registry,
                "observer_icmp_received",
                "Total number of ICMP echo replies received",
                &[TARGET_LABEL, ADDRESS_LABEL],
            )?,
            rtt: gauge_vec(
                &registry,
                "observer_icmp_rtt",
                "Average round trip time of the last ICMP measurement in seconds",
                &[TARGET_LABEL, ADDRESS_LABEL],
            )?,
        };

        Ok(Self {
            dhcp4,
            dhcp6,
            dns,
            icmp,
            registry: Arc::new(registry),
        })
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
