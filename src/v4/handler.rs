//! DHCPv4 state machine implementation
//!
//! This module implements the DHCPv4 client state machine that handles
//! one DORA (Discover, Offer, Request, Acknowledge) exchange and records
//! every packet of it.

use super::message::{
    build_dhcp_discover, build_dhcp_request, encode, message_type, server_identifier,
};
use crate::{
    client::{Action, DhcpStateMachine, Event},
    error::ProbeError,
};
use bytes::Bytes;
use dhcproto::{v4, Decodable};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, PartialEq, Clone, Copy)]
enum DhcpV4State {
    Init,
    Selecting,
    Requesting,
    Bound,
}

pub struct DhcpV4Handler {
    state: DhcpV4State,
    mac_address: Bytes,
    xid: u32,
    server: SocketAddr,
    timeout: Duration,
    conversation: Vec<v4::Message>,
}

impl DhcpV4Handler {
    pub fn new(mac_address: Bytes, server: SocketAddr, timeout: Duration) -> Self {
        Self {
            state: DhcpV4State::Init,
            mac_address,
            xid: rand::random(),
            server,
            timeout,
            conversation: Vec::new(),
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    fn send(&mut self, msg: v4::Message) -> Result<Action, ProbeError> {
        let packet = encode(&msg)?;
        self.conversation.push(msg);
        Ok(Action::Send(packet, self.server))
    }

    fn timed_out(&self, stage: &'static str) -> ProbeError {
        ProbeError::Timeout {
            stage,
            after: self.timeout,
        }
    }

    /// Decodes `data`, returning `None` for undecodable packets and packets
    /// of another transaction.
    fn decode_ours(&self, data: &[u8]) -> Option<v4::Message> {
        let msg = match v4::Message::decode(&mut v4::Decoder::new(data)) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Ignoring undecodable DHCP packet: {}", e);
                return None;
            }
        };

        if msg.xid() != self.xid {
            tracing::debug!("XID mismatch ({:x} != {:x}), ignoring packet", msg.xid(), self.xid);
            return None;
        }
        Some(msg)
    }

    fn handle_init(&mut self) -> Result<Action, ProbeError> {
        self.state = DhcpV4State::Selecting;
        let discover = build_dhcp_discover(&self.mac_address, self.xid);
        self.send(discover)
    }

    fn handle_selecting(&mut self, event: Event) -> Result<Action, ProbeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_ours(data) else {
                    return Ok(Action::Wait);
                };
                if message_type(&msg) != Some(v4::MessageType::Offer) {
                    tracing::debug!("Not a DHCP OFFER message: {:?}", message_type(&msg));
                    return Ok(Action::Wait);
                }

                let server_id = server_identifier(&msg).ok_or_else(|| {
                    ProbeError::Protocol("no server identifier in offer".to_string())
                })?;
                let offered_ip = msg.yiaddr();
                tracing::debug!(%offered_ip, %server_id, "Received DHCP OFFER");

                self.conversation.push(msg);
                self.state = DhcpV4State::Requesting;
                let request =
                    build_dhcp_request(&self.mac_address, self.xid, offered_ip, server_id);
                self.send(request)
            }
            Event::Timeout => Err(self.timed_out("waiting for DHCPOFFER")),
            Event::Start => Ok(Action::Wait),
        }
    }

    fn handle_requesting(&mut self, event: Event) -> Result<Action, ProbeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_ours(data) else {
                    return Ok(Action::Wait);
                };
                match message_type(&msg) {
                    Some(v4::MessageType::Ack) => {
                        self.conversation.push(msg);
                        self.state = DhcpV4State::Bound;
                        Ok(Action::Done)
                    }
                    Some(v4::MessageType::Nak) => {
                        tracing::warn!("Received DHCP NAK");
                        Err(ProbeError::Protocol("server answered with DHCPNAK".to_string()))
                    }
                    _ => Ok(Action::Wait),
                }
            }
            Event::Timeout => Err(self.timed_out("waiting for DHCPACK")),
            Event::Start => Ok(Action::Wait),
        }
    }
}

impl DhcpStateMachine for DhcpV4Handler {
    type Packet = v4::Message;

    fn state_name(&self) -> &'static str {
        match self.state {
            DhcpV4State::Init => "Init",
            DhcpV4State::Selecting => "Selecting",
            DhcpV4State::Requesting => "Requesting",
            DhcpV4State::Bound => "Bound",
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Action, ProbeError> {
        tracing::trace!("Handling event {:?} in state {:?}", event, self.state);
        match self.state {
            DhcpV4State::Init => self.handle_init(),
            DhcpV4State::Selecting => self.handle_selecting(event),
            DhcpV4State::Requesting => self.handle_requesting(event),
            DhcpV4State::Bound => Ok(Action::Done),
        }
    }

    fn into_conversation(self) -> Vec<v4::Message> {
        self.conversation
    }
}
