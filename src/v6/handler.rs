//! DHCPv6 state machine implementation
//!
//! Drives one SOLICIT / ADVERTISE / REQUEST / REPLY exchange. The raw
//! datagrams are kept so the probe can decode them on its own terms.

use super::message::{build_request, build_solicit, encode};
use crate::{
    client::{Action, DhcpStateMachine, Event},
    error::ProbeError,
};
use dhcproto::{v6, Decodable, Decoder};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, PartialEq, Clone, Copy)]
enum DhcpV6State {
    Init,
    Soliciting,
    Requesting,
    Bound,
}

pub struct DhcpV6Handler {
    state: DhcpV6State,
    duid: Vec<u8>,
    iaid: u32,
    xid: [u8; 3],
    server: SocketAddr,
    timeout: Duration,
    conversation: Vec<Vec<u8>>,
}

impl DhcpV6Handler {
    pub fn new(duid: Vec<u8>, server: SocketAddr, timeout: Duration) -> Self {
        Self {
            state: DhcpV6State::Init,
            duid,
            iaid: rand::random(),
            xid: rand::random(),
            server,
            timeout,
            conversation: Vec::new(),
        }
    }

    pub fn xid(&self) -> [u8; 3] {
        self.xid
    }

    fn send(&mut self, msg: v6::Message) -> Result<Action, ProbeError> {
        let packet = encode(&msg)?;
        self.conversation.push(packet.clone());
        Ok(Action::Send(packet, self.server))
    }

    fn decode_ours(&self, data: &[u8]) -> Option<v6::Message> {
        let msg = match v6::Message::decode(&mut Decoder::new(data)) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Ignoring undecodable DHCPv6 packet: {}", e);
                return None;
            }
        };
        if msg.xid() != self.xid {
            tracing::debug!("Transaction id mismatch, ignoring packet");
            return None;
        }
        Some(msg)
    }

    fn handle_init(&mut self) -> Result<Action, ProbeError> {
        self.state = DhcpV6State::Soliciting;
        let solicit = build_solicit(&self.duid, self.iaid, self.xid);
        self.send(solicit)
    }

    fn handle_soliciting(&mut self, event: Event) -> Result<Action, ProbeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_ours(data) else {
                    return Ok(Action::Wait);
                };
                if msg.msg_type() != v6::MessageType::Advertise {
                    return Ok(Action::Wait);
                }
                tracing::debug!("Received DHCPv6 ADVERTISE");
                self.conversation.push(data.to_vec());

                // REQUEST starts a new transaction
                self.xid = rand::random();
                let request = build_request(&self.duid, self.iaid, self.xid, &msg)?;
                self.state = DhcpV6State::Requesting;
                self.send(request)
            }
            Event::Timeout => Err(ProbeError::Timeout {
                stage: "waiting for ADVERTISE",
                after: self.timeout,
            }),
            Event::Start => Ok(Action::Wait),
        }
    }

    fn handle_requesting(&mut self, event: Event) -> Result<Action, ProbeError> {
        match event {
            Event::PacketReceived(data) => {
                let Some(msg) = self.decode_ours(data) else {
                    return Ok(Action::Wait);
                };
                if msg.msg_type() != v6::MessageType::Reply {
                    return Ok(Action::Wait);
                }
                self.conversation.push(data.to_vec());
                self.state = DhcpV6State::Bound;
                Ok(Action::Done)
            }
            Event::Timeout => Err(ProbeError::Timeout {
                stage: "waiting for REPLY",
                after: self.timeout,
            }),
            Event::Start => Ok(Action::Wait),
        }
    }
}

impl DhcpStateMachine for DhcpV6Handler {
    type Packet = Vec<u8>;

    fn state_name(&self) -> &'static str {
        match self.state {
            DhcpV6State::Init => "Init",
            DhcpV6State::Soliciting => "Soliciting",
            DhcpV6State::Requesting => "Requesting",
            DhcpV6State::Bound => "Bound",
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Action, ProbeError> {
        match self.state {
            DhcpV6State::Init => self.handle_init(),
            DhcpV6State::Soliciting => self.handle_soliciting(event),
            DhcpV6State::Requesting => self.handle_requesting(event),
            DhcpV6State::Bound => Ok(Action::Done),
        }
    }

    fn into_conversation(self) -> Vec<Vec<u8>> {
        self.conversation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::message::ALL_DHCP_SERVERS;
    use std::net::SocketAddrV6;

    fn handler() -> DhcpV6Handler {
        let server = SocketAddr::V6(SocketAddrV6::new(ALL_DHCP_SERVERS, 547, 0, 1));
        DhcpV6Handler::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6], server, Duration::from_secs(5))
    }

    fn reply_to(kind: v6::MessageType, xid: [u8; 3]) -> Vec<u8> {
        let mut msg = v6::Message::new_with_id(kind, xid);
        msg.opts_mut()
            .insert(v6::DhcpOption::ServerId(vec![0, 1, 0, 1].into()));
        encode(&msg).unwrap()
    }

    #[test]
    fn test_full_exchange() {
        let mut handler = handler();
        let action = handler.handle_event(Event::Start).unwrap();
        assert!(matches!(action, Action::Send(_, addr) if addr.port() == 547));
        assert_eq!(handler.state_name(), "Soliciting");

        let advertise = reply_to(v6::MessageType::Advertise, handler.xid());
        let action = handler
            .handle_event(Event::PacketReceived(&advertise))
            .unwrap();
        assert!(matches!(action, Action::Send(_, _)));
        assert_eq!(handler.state_name(), "Requesting");

        let reply = reply_to(v6::MessageType::Reply, handler.xid());
        let action = handler.handle_event(Event::PacketReceived(&reply)).unwrap();
        assert!(matches!(action, Action::Done));

        let conversation = handler.into_conversation();
        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation[3], reply);
    }

    #[test]
    fn test_foreign_transaction_is_ignored() {
        let mut handler = handler();
        handler.handle_event(Event::Start).unwrap();
        let mut xid = handler.xid();
        xid[0] = xid[0].wrapping_add(1);

        let advertise = reply_to(v6::MessageType::Advertise, xid);
        let action = handler
            .handle_event(Event::PacketReceived(&advertise))
            .unwrap();
        assert!(matches!(action, Action::Wait));
        assert_eq!(handler.state_name(), "Soliciting");
    }

    #[test]
    fn test_undecodable_packet_is_ignored() {
        let mut handler = handler();
        handler.handle_event(Event::Start).unwrap();

        let action = handler.handle_event(Event::PacketReceived(&[0x02])).unwrap();
        assert!(matches!(action, Action::Wait));
        assert_eq!(handler.state_name(), "Soliciting");
    }

    #[test]
    fn test_timeout_is_an_error() {
        let mut handler = handler();
        handler.handle_event(Event::Start).unwrap();
        assert!(matches!(
            handler.handle_event(Event::Timeout),
            Err(ProbeError::Timeout { .. })
        ));
    }
}
