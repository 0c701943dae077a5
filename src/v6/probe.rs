use super::{
    handler::DhcpV6Handler,
    message::{duid_ll, first_ia_address, ALL_DHCP_SERVERS},
};
use crate::{
    client::{Handshake, HandshakeDriver, Lease},
    config::ClientConfig,
    error::ProbeError,
    metrics::Dhcp6Metrics,
    network::{self, IpFamily},
    observer::LeaseProbe,
};
use async_trait::async_trait;
use dhcproto::{v6, Decodable, Decoder};
use std::{
    net::{IpAddr, SocketAddr, SocketAddrV6},
    time::Duration,
};

/// DHCPv6 addresses are claimed as host addresses.
pub const DHCPV6_PREFIX_LEN: u8 = 128;

/// One complete DHCPv6 handshake over the link, as raw datagrams.
#[async_trait]
pub trait DhcpV6Exchange: Send + Sync {
    async fn exchange(&self) -> Result<Handshake<Vec<u8>>, ProbeError>;
}

/// [`DhcpV6Exchange`] multicasting to all DHCP servers on the configured interface.
pub struct DhcpV6Client {
    config: ClientConfig,
}

impl DhcpV6Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DhcpV6Exchange for DhcpV6Client {
    async fn exchange(&self) -> Result<Handshake<Vec<u8>>, ProbeError> {
        let interface = &self.config.interface;
        let socket =
            network::new_tokio_socket_bound_to_device(interface, IpFamily::V6, self.config.client_port)?;
        let scope_id = network::interface_index(interface)?;
        let mac_address = network::hardware_address(interface).await?;
        let server = SocketAddr::V6(SocketAddrV6::new(
            ALL_DHCP_SERVERS,
            self.config.server_port,
            0,
            scope_id,
        ));

        let handler = DhcpV6Handler::new(duid_ll(&mac_address), server, self.config.timeout);
        HandshakeDriver::new(socket, self.config.timeout)
            .run(handler)
            .await
    }
}

/// Runs DHCPv6 handshakes and turns them into metrics and a [`Lease`].
pub struct Dhcp6Probe<E> {
    exchange: E,
    metrics: Dhcp6Metrics,
    verbose: bool,
}

impl<E: DhcpV6Exchange> Dhcp6Probe<E> {
    pub fn new(exchange: E, metrics: Dhcp6Metrics, verbose: bool) -> Self {
        Self {
            exchange,
            metrics,
            verbose,
        }
    }

    fn fail(&self, error: ProbeError) -> ProbeError {
        self.metrics.failures.inc();
        error
    }

    pub async fn sample(&self) -> Result<Lease, ProbeError> {
        self.metrics.requests.inc();

        let handshake = self.exchange.exchange().await.map_err(|e| self.fail(e))?;
        self.metrics.latency.set(handshake.latency.as_secs_f64());

        let mut lease = None;
        for packet in &handshake.packets {
            let message = v6::Message::decode(&mut Decoder::new(packet)).map_err(|e| {
                self.fail(ProbeError::Protocol(format!(
                    "could not decode DHCPv6 message: {e}"
                )))
            })?;

            if self.verbose {
                tracing::info!(
                    message_type = ?message.msg_type(),
                    "DHCPv6 packet: {:?}",
                    message.opts()
                );
            }

            match message.msg_type() {
                v6::MessageType::Advertise => self.metrics.offers.inc(),
                v6::MessageType::Reply => {
                    self.metrics.replies.inc();
                    let address = first_ia_address(&message).ok_or_else(|| {
                        self.fail(ProbeError::Protocol(
                            "reply carries no IA_NA address".to_string(),
                        ))
                    })?;
                    self.metrics.lifetime.set(f64::from(address.valid_life));
                    lease = Some(Lease::new(
                        IpAddr::V6(address.addr),
                        DHCPV6_PREFIX_LEN,
                        Some(Duration::from_secs(u64::from(address.valid_life))),
                    ));
                }
                _ => {}
            }
        }

        lease.ok_or_else(|| self.fail(ProbeError::NoReplyReceived))
    }
}

#[async_trait]
impl<E: DhcpV6Exchange> LeaseProbe for Dhcp6Probe<E> {
    fn family(&self) -> IpFamily {
        IpFamily::V6
    }

    async fn acquire(&self) -> Result<Lease, ProbeError> {
        self.sample().await
    }
}
