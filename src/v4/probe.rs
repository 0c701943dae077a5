use super::{
    handler::DhcpV4Handler,
    message::{lease_time, message_type, subnet_prefix_len},
};
use crate::{
    client::{Handshake, HandshakeDriver, Lease},
    config::ClientConfig,
    error::ProbeError,
    metrics::Dhcp4Metrics,
    network::{self, IpFamily},
    observer::LeaseProbe,
};
use async_trait::async_trait;
use dhcproto::v4;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

/// One complete DHCPv4 handshake over the link.
#[async_trait]
pub trait DhcpV4Exchange: Send + Sync {
    async fn exchange(&self) -> Result<Handshake<v4::Message>, ProbeError>;
}

/// [`DhcpV4Exchange`] broadcasting on the configured interface.
pub struct DhcpV4Client {
    config: ClientConfig,
}

impl DhcpV4Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DhcpV4Exchange for DhcpV4Client {
    async fn exchange(&self) -> Result<Handshake<v4::Message>, ProbeError> {
        let socket = network::new_tokio_socket_bound_to_device(
            &self.config.interface,
            IpFamily::V4,
            self.config.client_port,
        )?;
        let mac_address = network::hardware_address(&self.config.interface).await?;
        let server = SocketAddr::new(Ipv4Addr::BROADCAST.into(), self.config.server_port);

        let handler = DhcpV4Handler::new(mac_address, server, self.config.timeout);
        HandshakeDriver::new(socket, self.config.timeout)
            .run(handler)
            .await
    }
}

/// Prefix length used when an ACK carries no subnet mask.
const HOST_PREFIX_LEN: u8 = 32;

/// Runs DHCPv4 handshakes and turns them into metrics and a [`Lease`].
pub struct Dhcp4Probe<E> {
    exchange: E,
    metrics: Dhcp4Metrics,
    verbose: bool,
}

impl<E: DhcpV4Exchange> Dhcp4Probe<E> {
    pub fn new(exchange: E, metrics: Dhcp4Metrics, verbose: bool) -> Self {
        Self {
            exchange,
            metrics,
            verbose,
        }
    }

    pub async fn sample(&self) -> Result<Lease, ProbeError> {
        self.metrics.requests.inc();

        let handshake = match self.exchange.exchange().await {
            Ok(handshake) => handshake,
            Err(e) => {
                self.metrics.failures.inc();
                return Err(e);
            }
        };
        self.metrics.latency.set(handshake.latency.as_secs_f64());

        let mut lease = None;
        for packet in &handshake.packets {
            if self.verbose {
                tracing::info!(
                    message_type = ?message_type(packet),
                    xid = %format!("{:#010x}", packet.xid()),
                    yiaddr = %packet.yiaddr(),
                    "DHCPv4 packet: {:?}",
                    packet.opts()
                );
            }

            match message_type(packet) {
                Some(v4::MessageType::Offer) => self.metrics.offers.inc(),
                Some(v4::MessageType::Ack) => {
                    let lifetime = lease_time(packet);
                    if let Some(secs) = lifetime {
                        self.metrics.lease_time.set(f64::from(secs));
                    }
                    lease = Some(Lease::new(
                        IpAddr::V4(packet.yiaddr()),
                        subnet_prefix_len(packet).unwrap_or(HOST_PREFIX_LEN),
                        lifetime.map(|secs| Duration::from_secs(u64::from(secs))),
                    ));
                }
                _ => {}
            }
        }

        lease.ok_or_else(|| {
            self.metrics.failures.inc();
            ProbeError::NoAckReceived
        })
    }
}

#[async_trait]
impl<E: DhcpV4Exchange> LeaseProbe for Dhcp4Probe<E> {
    fn family(&self) -> IpFamily {
        IpFamily::V4
    }

    async fn acquire(&self) -> Result<Lease, ProbeError> {
        self.sample().await
    }
}
