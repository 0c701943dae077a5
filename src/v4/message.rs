use crate::error::ProbeError;
use bytes::{BufMut as _, Bytes, BytesMut};
use dhcproto::{
    v4::{self, OptionCode},
    Encodable as _, Encoder,
};
use std::net::Ipv4Addr;

fn client_identifier(mac_addr: &Bytes) -> v4::DhcpOption {
    // htype 1 (Ethernet) followed by the MAC address
    let mut client_id_data = BytesMut::new();
    client_id_data.put_u8(1);
    client_id_data.extend_from_slice(mac_addr);
    v4::DhcpOption::ClientIdentifier(client_id_data.freeze().to_vec())
}

fn parameter_request_list() -> v4::DhcpOption {
    v4::DhcpOption::ParameterRequestList(vec![
        OptionCode::SubnetMask,       // 1
        OptionCode::Router,           // 3
        OptionCode::DomainNameServer, // 6
        OptionCode::DomainName,       // 15
        OptionCode::AddressLeaseTime, // 51
    ])
}

/// Constructs a DHCP Discover message.
pub fn build_dhcp_discover(mac_addr: &Bytes, xid: u32) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootRequest)
        .set_chaddr(mac_addr)
        .set_htype(v4::HType::Eth)
        .set_hops(0)
        .set_xid(xid)
        .set_secs(0)
        .set_flags(v4::Flags::default().set_broadcast());

    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg.opts_mut().insert(parameter_request_list());
    msg
}

/// Constructs a DHCP Request for the address offered by `server_ip`.
pub fn build_dhcp_request(
    mac_addr: &Bytes,
    xid: u32,
    offered_ip: Ipv4Addr,
    server_ip: Ipv4Addr,
) -> v4::Message {
    let mut msg = v4::Message::default();
    msg.set_opcode(v4::Opcode::BootRequest)
        .set_chaddr(mac_addr)
        .set_htype(v4::HType::Eth)
        .set_xid(xid)
        .set_flags(v4::Flags::default().set_broadcast())
        .set_ciaddr(Ipv4Addr::UNSPECIFIED);

    msg.opts_mut()
        .insert(v4::DhcpOption::MessageType(v4::MessageType::Request));
    msg.opts_mut()
        .insert(v4::DhcpOption::RequestedIpAddress(offered_ip));
    msg.opts_mut()
        .insert(v4::DhcpOption::ServerIdentifier(server_ip));
    msg.opts_mut().insert(client_identifier(mac_addr));
    msg.opts_mut().insert(parameter_request_list());
    msg
}

/// Serializes `msg` to wire format.
pub fn encode(msg: &v4::Message) -> Result<Vec<u8>, ProbeError> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)
        .map_err(|e| ProbeError::Protocol(format!("failed to encode DHCPv4 message: {e}")))?;
    Ok(buffer)
}

/// Returns the DHCP message type option of `msg`, if any.
pub fn message_type(msg: &v4::Message) -> Option<v4::MessageType> {
    match msg.opts().get(OptionCode::MessageType) {
        Some(v4::DhcpOption::MessageType(kind)) => Some(*kind),
        _ => None,
    }
}

/// Prefix length of the subnet mask option, `None` when the option is absent.
pub fn subnet_prefix_len(msg: &v4::Message) -> Option<u8> {
    match msg.opts().get(OptionCode::SubnetMask) {
        Some(v4::DhcpOption::SubnetMask(mask)) => Some(u32::from(*mask).count_ones() as u8),
        _ => None,
    }
}

/// Lease time option (51) in seconds, if present.
pub fn lease_time(msg: &v4::Message) -> Option<u32> {
    match msg.opts().get(OptionCode::AddressLeaseTime) {
        Some(v4::DhcpOption::AddressLeaseTime(secs)) => Some(*secs),
        _ => None,
    }
}

pub fn server_identifier(msg: &v4::Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::ServerIdentifier) {
        Some(v4::DhcpOption::ServerIdentifier(ip)) => Some(*ip),
        _ => None,
    }
}
