//! DHCP handshake driver
//!
//! This module contains the protocol-independent parts of a DHCP exchange:
//! - The state machine trait implemented by the v4 and v6 handlers
//! - The socket driver that feeds packets and timeouts into it
//! - The lease extracted from a completed handshake

use crate::{
    error::ProbeError,
    network::{address::InterfaceAddress, IpFamily},
};
use chrono::{DateTime, Utc};
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time::{self, Instant},
};

/// Actions a state machine asks the driver to perform.
#[derive(Debug)]
pub enum Action {
    Send(Vec<u8>, SocketAddr),
    Wait,
    Done,
}

/// External events a state machine reacts to.
#[derive(Debug)]
pub enum Event<'a> {
    Start,
    PacketReceived(&'a [u8]),
    Timeout,
}

/// Common trait of the DHCPv4 and DHCPv6 client state machines.
pub trait DhcpStateMachine {
    /// Packet representation kept in the conversation.
    type Packet;

    /// Handles one event and returns the next action to execute.
    fn handle_event(&mut self, event: Event) -> Result<Action, ProbeError>;

    /// Name of the current state (for logging).
    fn state_name(&self) -> &'static str;

    /// Consumes the machine and returns every packet of the handshake in order.
    fn into_conversation(self) -> Vec<Self::Packet>;
}

/// Completed handshake: all packets in order plus the time until the first accepted reply.
#[derive(Debug, Clone)]
pub struct Handshake<P> {
    pub packets: Vec<P>,
    pub latency: Duration,
}

/// Address obtained from a DHCP handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub address: IpAddr,
    pub prefix_len: u8,
    /// Lease time (v4) or valid lifetime (v6), when the server announced one.
    pub lifetime: Option<Duration>,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(address: IpAddr, prefix_len: u8, lifetime: Option<Duration>) -> Self {
        Self {
            address,
            prefix_len,
            lifetime,
            acquired_at: Utc::now(),
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.address)
    }

    pub fn interface_address(&self) -> InterfaceAddress {
        InterfaceAddress::new(self.address, self.prefix_len)
    }
}

/// Runs a [`DhcpStateMachine`] over a bound UDP socket.
///
/// Every wait is bounded by `timeout`; the deadline is re-armed after each send.
pub struct HandshakeDriver {
    socket: UdpSocket,
    timeout: Duration,
}

impl HandshakeDriver {
    pub fn new(socket: UdpSocket, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    pub async fn run<M: DhcpStateMachine>(
        &self,
        mut machine: M,
    ) -> Result<Handshake<M::Packet>, ProbeError> {
        let started = Instant::now();
        let mut first_reply = None;
        let mut deadline = started + self.timeout;
        let mut next_action = machine.handle_event(Event::Start)?;

        loop {
            tracing::debug!(
                "State: {}, Action: {:?}",
                machine.state_name(),
                next_action
            );

            match next_action {
                Action::Send(packet, addr) => {
                    self.socket.send_to(&packet, addr).await?;
                    deadline = Instant::now() + self.timeout;
                    next_action = self
                        .wait_for_response(&mut machine, deadline, started, &mut first_reply)
                        .await?;
                }
                Action::Wait => {
                    next_action = self
                        .wait_for_response(&mut machine, deadline, started, &mut first_reply)
                        .await?;
                }
                Action::Done => {
                    let latency = first_reply.unwrap_or_else(|| started.elapsed());
                    return Ok(Handshake {
                        packets: machine.into_conversation(),
                        latency,
                    });
                }
            }
        }
    }

    async fn wait_for_response<M: DhcpStateMachine>(
        &self,
        machine: &mut M,
        deadline: Instant,
        started: Instant,
        first_reply: &mut Option<Duration>,
    ) -> Result<Action, ProbeError> {
        let mut buf = [0u8; 1500];
        match time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                tracing::debug!("Received {} bytes from {}", len, addr);
                let received_after = started.elapsed();
                let action = machine.handle_event(Event::PacketReceived(&buf[..len]))?;
                // ignored packets (other transactions, stray traffic) answer Wait
                if !matches!(action, Action::Wait) {
                    first_reply.get_or_insert(received_after);
                }
                Ok(action)
            }
            Ok(Err(e)) => {
                tracing::error!("Socket receive error: {}", e);
                Err(ProbeError::Transport(e))
            }
            Err(_) => {
                tracing::debug!("Timeout waiting for response");
                machine.handle_event(Event::Timeout)
            }
        }
    }
}
