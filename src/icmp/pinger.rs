use super::{
    packet::{build_echo_request, parse_echo_reply},
    PingStatistics, Pinger,
};
use crate::{
    config::ResolveFamily,
    error::ProbeError,
    network::{IpFamily, SocketError},
};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket},
    str::FromStr,
    time::Duration,
};
use tokio::{
    net::{lookup_host, UdpSocket},
    time::{self, Instant},
};
use tracing::debug;

/// Spacing between echo requests; also how long a request may wait for its reply.
pub const ECHO_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves `target` to one address of an allowed family.
pub async fn resolve_target(target: &str, family: ResolveFamily) -> Result<IpAddr, ProbeError> {
    let unresolvable = || ProbeError::Resolve {
        target: target.to_string(),
    };
    if let Ok(addr) = IpAddr::from_str(target) {
        return family
            .allows(IpFamily::of(&addr))
            .then_some(addr)
            .ok_or_else(unresolvable);
    }
    let addrs = lookup_host((target, 0)).await.map_err(|_| unresolvable())?;
    addrs
        .map(|addr| addr.ip())
        .find(|ip| family.allows(IpFamily::of(ip)))
        .ok_or_else(unresolvable)
}

/// Opens a raw ICMP (or ICMPv6) socket. Needs `CAP_NET_RAW`.
fn raw_icmp_socket(family: IpFamily) -> Result<UdpSocket, SocketError> {
    let (domain, protocol) = match family {
        IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
        IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket =
        Socket::new(domain, Type::RAW, Some(protocol)).map_err(SocketError::CreateSocket)?;
    socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    // tokio's datagram socket works on any message-oriented descriptor
    let std_socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// [`Pinger`] sending echo requests over a raw socket.
pub struct RawPinger {
    interval: Duration,
}

impl Default for RawPinger {
    fn default() -> Self {
        Self {
            interval: ECHO_INTERVAL,
        }
    }
}

impl RawPinger {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Pinger for RawPinger {
    async fn resolve(&self, target: &str, family: ResolveFamily) -> Result<IpAddr, ProbeError> {
        resolve_target(target, family).await
    }

    async fn ping(&self, address: IpAddr, count: u32) -> Result<PingStatistics, ProbeError> {
        let family = IpFamily::of(&address);
        let socket = raw_icmp_socket(family)?;
        let destination = SocketAddr::new(address, 0);
        let identifier: u16 = rand::random();

        let mut sent_at = Vec::with_capacity(count as usize);
        let mut rtts: Vec<Option<Duration>> = vec![None; count as usize];
        let mut buf = [0u8; 1500];

        for sequence in 0..count {
            let request = build_echo_request(family, identifier, sequence as u16);
            socket.send_to(&request, destination).await?;
            let started = Instant::now();
            sent_at.push(started);

            let deadline = started + self.interval;
            while let Ok(received) = time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                let (len, from) = received?;
                if from.ip() != address {
                    continue;
                }
                let Some(reply) = parse_echo_reply(family, &buf[..len]) else {
                    continue;
                };
                let seq = usize::from(reply.sequence);
                if reply.identifier != identifier || seq >= sent_at.len() {
                    continue;
                }
                if rtts[seq].is_none() {
                    rtts[seq] = Some(sent_at[seq].elapsed());
                    debug!(%address, sequence = seq, "Echo reply received");
                }
            }
        }

        Ok(PingStatistics::from_rtts(address, count, &rtts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_respects_family() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            resolve_target("10.0.0.1", ResolveFamily::Any).await.unwrap(),
            v4
        );
        assert_eq!(resolve_target("10.0.0.1", ResolveFamily::V4).await.unwrap(), v4);
        assert!(matches!(
            resolve_target("10.0.0.1", ResolveFamily::V6).await,
            Err(ProbeError::Resolve { .. })
        ));
        assert!(resolve_target("2001:db8::1", ResolveFamily::V6).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_localhost_by_name() {
        let addr = resolve_target("localhost", ResolveFamily::Any).await.unwrap();
        assert!(addr.is_loopback());
    }
}
