//! DNS liveness and staleness probe
//!
//! Every resolver is asked directly for the TXT record of the healthcheck
//! name. The record is expected to hold a Unix timestamp refreshed by the
//! zone owner; its age tells how stale the resolver's view is.

use crate::{
    config::DnsFailurePolicy, error::ProbeError, metrics::DnsMetrics, observer::Probe,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RData, RecordType},
    serialize::binary::{BinDecodable, BinEncodable},
};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};
use tokio::{
    net::{lookup_host, UdpSocket},
    time::{self, Instant},
};
use tracing::{debug, warn};

pub const DNS_PORT: u16 = 53;

/// One answer record, reduced to what the probe needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// TXT record with its character strings concatenated.
    Txt(String),
    Other(RecordType),
}

#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub answers: Vec<Answer>,
    pub rtt: Duration,
}

/// Sends one TXT query straight to a resolver.
#[async_trait]
pub trait DnsExchange: Send + Sync {
    async fn query_txt(&self, resolver: &str, qname: &str) -> Result<DnsResponse, ProbeError>;
}

/// [`DnsExchange`] over plain UDP.
pub struct UdpDnsClient {
    timeout: Duration,
}

impl UdpDnsClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Resolves a resolver target (`ip`, `ip:port`, `[v6]:port` or hostname).
pub async fn resolver_address(resolver: &str) -> Result<SocketAddr, ProbeError> {
    if let Ok(addr) = SocketAddr::from_str(resolver) {
        return Ok(addr);
    }
    if let Ok(ip) = IpAddr::from_str(resolver) {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }
    lookup_host((resolver, DNS_PORT))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ProbeError::Resolve {
            target: resolver.to_string(),
        })
}

pub fn build_query(qname: &str) -> Result<Message, ProbeError> {
    let name = Name::from_ascii(qname)
        .map_err(|e| ProbeError::Protocol(format!("invalid query name '{qname}': {e}")))?;
    let mut msg = Message::new();
    msg.set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(name, RecordType::TXT));
    Ok(msg)
}

/// Maps the answer section of `msg` onto [`Answer`]s.
pub fn typed_answers(msg: &Message) -> Vec<Answer> {
    msg.answers()
        .iter()
        .map(|record| match record.data() {
            RData::TXT(txt) => Answer::Txt(
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect(),
            ),
            _ => Answer::Other(record.record_type()),
        })
        .collect()
}

#[async_trait]
impl DnsExchange for UdpDnsClient {
    async fn query_txt(&self, resolver: &str, qname: &str) -> Result<DnsResponse, ProbeError> {
        let server = resolver_address(resolver).await?;
        let bind_addr: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let query = build_query(qname)?;
        let packet = query
            .to_vec()
            .map_err(|e| ProbeError::Protocol(format!("failed to encode DNS query: {e}")))?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        socket.send_to(&packet, server).await?;

        let mut buf = [0u8; 4096];
        loop {
            let (len, from) = time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| ProbeError::Timeout {
                    stage: "waiting for DNS answer",
                    after: self.timeout,
                })??;
            if from.ip() != server.ip() {
                debug!(%from, "Ignoring datagram from unexpected peer");
                continue;
            }
            let response = Message::from_vec(&buf[..len])
                .map_err(|e| ProbeError::Protocol(format!("malformed DNS answer: {e}")))?;
            if response.id() != query.id() {
                debug!("DNS id mismatch, ignoring answer");
                continue;
            }
            return Ok(DnsResponse {
                answers: typed_answers(&response),
                rtt: started.elapsed(),
            });
        }
    }
}

/// Seconds between the timestamp published in the first TXT answer and `now`.
pub fn staleness(answers: &[Answer], now: DateTime<Utc>) -> Result<f64, ProbeError> {
    let payload = answers
        .iter()
        .find_map(|answer| match answer {
            Answer::Txt(text) => Some(text),
            Answer::Other(_) => None,
        })
        .ok_or_else(|| ProbeError::Parse("answer holds no TXT record".to_string()))?;

    let timestamp: i64 = payload
        .trim()
        .parse()
        .map_err(|_| ProbeError::Parse(format!("'{payload}' is not a Unix timestamp")))?;

    Ok(now.timestamp_millis() as f64 / 1000.0 - timestamp as f64)
}

pub struct DnsProbe<X> {
    exchange: X,
    targets: Vec<String>,
    qname: String,
    policy: DnsFailurePolicy,
    metrics: DnsMetrics,
}

impl<X: DnsExchange> DnsProbe<X> {
    pub fn new(
        exchange: X,
        targets: Vec<String>,
        qname: String,
        policy: DnsFailurePolicy,
        metrics: DnsMetrics,
    ) -> Self {
        Self {
            exchange,
            targets,
            qname,
            policy,
            metrics,
        }
    }

    /// Probes every resolver in order.
    ///
    /// With [`DnsFailurePolicy::Continue`] all resolvers are probed and the
    /// first failure is returned afterwards; with `Abort` the first failure
    /// ends the pass.
    pub async fn sample(&self) -> Result<(), ProbeError> {
        let mut first_error = None;
        for resolver in &self.targets {
            if let Err(e) = self.probe_resolver(resolver).await {
                warn!(resolver = %resolver, error = %e, "DNS probe failed");
                if self.policy == DnsFailurePolicy::Abort {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn probe_resolver(&self, resolver: &str) -> Result<(), ProbeError> {
        let labels = [resolver];
        self.metrics.requests.with_label_values(&labels).inc();

        let response = match self.exchange.query_txt(resolver, &self.qname).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.failures.with_label_values(&labels).inc();
                return Err(e);
            }
        };

        if response.answers.is_empty() {
            self.metrics.failures.with_label_values(&labels).inc();
            return Err(ProbeError::EmptyResult {
                resolver: resolver.to_string(),
            });
        }

        self.metrics
            .rtt
            .with_label_values(&labels)
            .set(response.rtt.as_secs_f64());

        match staleness(&response.answers, Utc::now()) {
            Ok(age) => self.metrics.age.with_label_values(&labels).set(age),
            Err(e) => {
                self.metrics.parse_failures.with_label_values(&labels).inc();
                warn!(resolver = %resolver, error = %e, "Healthcheck record unusable");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<X: DnsExchange> Probe for DnsProbe<X> {
    fn name(&self) -> &'static str {
        "DNS"
    }

    async fn sample(&self) -> Result<(), ProbeError> {
        DnsProbe::sample(self).await
    }
}
