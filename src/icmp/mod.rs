//! ICMP reachability probe
//!
//! Sends a burst of echo requests to every configured target and reports
//! packet counts and the average round trip time, labelled by the target and
//! the address it resolved to.

pub mod packet;
pub mod pinger;

pub use pinger::{resolve_target, RawPinger, ECHO_INTERVAL};

use crate::{
    config::ResolveFamily, error::ProbeError, metrics::IcmpMetrics, observer::Probe,
};
use async_trait::async_trait;
use std::{net::IpAddr, time::Duration};
use tracing::warn;

/// Outcome of one completed echo burst.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStatistics {
    pub address: IpAddr,
    pub sent: u32,
    pub received: u32,
    /// Zero when nothing came back.
    pub avg_rtt: Duration,
}

impl PingStatistics {
    /// Builds statistics from one slot per request, `None` for a lost reply.
    pub fn from_rtts(address: IpAddr, sent: u32, rtts: &[Option<Duration>]) -> Self {
        let answered: Vec<Duration> = rtts.iter().flatten().copied().collect();
        let received = answered.len() as u32;
        let avg_rtt = if received == 0 {
            Duration::ZERO
        } else {
            answered.iter().sum::<Duration>() / received
        };
        Self {
            address,
            sent,
            received,
            avg_rtt,
        }
    }

    pub fn is_lossless(&self) -> bool {
        self.sent == self.received
    }
}

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Resolves `target` within the allowed address family.
    async fn resolve(&self, target: &str, family: ResolveFamily) -> Result<IpAddr, ProbeError>;

    /// Sends `count` echo requests to `address` and collects the replies.
    async fn ping(&self, address: IpAddr, count: u32) -> Result<PingStatistics, ProbeError>;
}

pub struct IcmpProbe<P> {
    pinger: P,
    targets: Vec<String>,
    count: u32,
    family: ResolveFamily,
    metrics: IcmpMetrics,
}

impl<P: Pinger> IcmpProbe<P> {
    pub fn new(
        pinger: P,
        targets: Vec<String>,
        count: u32,
        family: ResolveFamily,
        metrics: IcmpMetrics,
    ) -> Self {
        Self {
            pinger,
            targets,
            count,
            family,
            metrics,
        }
    }

    /// Measures every target in order. A target that cannot be resolved or
    /// pinged is counted and skipped; the first such error is returned once
    /// all targets had their turn.
    pub async fn sample(&self) -> Result<(), ProbeError> {
        let mut first_error = None;
        for target in &self.targets {
            self.metrics
                .requests
                .with_label_values(&[target.as_str()])
                .inc_by(u64::from(self.count));
            let failures = self.metrics.failures.with_label_values(&[target.as_str()]);
            failures.inc_by(0);

            match self.measure(target).await {
                Ok(stats) if !stats.is_lossless() => {
                    failures.inc();
                    warn!(
                        target = %target,
                        sent = stats.sent,
                        received = stats.received,
                        "ICMP packet loss"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    failures.inc();
                    warn!(target = %target, error = %e, "ICMP probe failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn measure(&self, target: &str) -> Result<PingStatistics, ProbeError> {
        let address = self.pinger.resolve(target, self.family).await?;
        let stats = self.pinger.ping(address, self.count).await?;

        let address = stats.address.to_string();
        let labels = [target, address.as_str()];
        self.metrics
            .sent
            .with_label_values(&labels)
            .inc_by(u64::from(stats.sent));
        self.metrics
            .received
            .with_label_values(&labels)
            .inc_by(u64::from(stats.received));
        // total loss reads as 0 rather than the previous run's average
        self.metrics
            .rtt
            .with_label_values(&labels)
            .set(stats.avg_rtt.as_secs_f64());
        Ok(stats)
    }
}

#[async_trait]
impl<P: Pinger> Probe for IcmpProbe<P> {
    fn name(&self) -> &'static str {
        "ICMP"
    }

    async fn sample(&self) -> Result<(), ProbeError> {
        IcmpProbe::sample(self).await
    }
}
