use crate::error::ProbeError;
use bytes::{BufMut as _, Bytes, BytesMut};
use dhcproto::{v6, Encodable as _, Encoder};
use std::net::Ipv6Addr;

/// All_DHCP_Relay_Agents_and_Servers (RFC 8415).
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Builds a DUID-LL (type 3) for an Ethernet hardware address.
pub fn duid_ll(mac_addr: &Bytes) -> Vec<u8> {
    let mut duid = BytesMut::with_capacity(4 + mac_addr.len());
    duid.put_u16(3); // DUID-LL
    duid.put_u16(1); // hardware type Ethernet
    duid.extend_from_slice(mac_addr);
    duid.freeze().to_vec()
}

fn option_request() -> v6::DhcpOption {
    v6::DhcpOption::ORO(v6::ORO {
        opts: vec![v6::OptionCode::DomainNameServers],
    })
}

fn empty_ia_na(iaid: u32) -> v6::DhcpOption {
    v6::DhcpOption::IANA(v6::IANA {
        id: iaid,
        t1: 0,
        t2: 0,
        opts: v6::DhcpOptions::new(),
    })
}

/// Constructs a SOLICIT asking for one non-temporary address.
pub fn build_solicit(duid: &[u8], iaid: u32, xid: [u8; 3]) -> v6::Message {
    let mut msg = v6::Message::new_with_id(v6::MessageType::Solicit, xid);
    msg.opts_mut()
        .insert(v6::DhcpOption::ClientId(duid.to_vec().into()));
    msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
    msg.opts_mut().insert(option_request());
    msg.opts_mut().insert(empty_ia_na(iaid));
    msg
}

/// Constructs a REQUEST for the address carried by `advertise`.
pub fn build_request(
    duid: &[u8],
    iaid: u32,
    xid: [u8; 3],
    advertise: &v6::Message,
) -> Result<v6::Message, ProbeError> {
    let server_id = advertise
        .opts()
        .get(v6::OptionCode::ServerId)
        .cloned()
        .ok_or_else(|| ProbeError::Protocol("no server identifier in advertise".to_string()))?;
    let ia_na = advertise
        .opts()
        .get(v6::OptionCode::IANA)
        .cloned()
        .unwrap_or_else(|| empty_ia_na(iaid));

    let mut msg = v6::Message::new_with_id(v6::MessageType::Request, xid);
    msg.opts_mut()
        .insert(v6::DhcpOption::ClientId(duid.to_vec().into()));
    msg.opts_mut().insert(server_id);
    msg.opts_mut().insert(v6::DhcpOption::ElapsedTime(0));
    msg.opts_mut().insert(option_request());
    msg.opts_mut().insert(ia_na);
    Ok(msg)
}

pub fn encode(msg: &v6::Message) -> Result<Vec<u8>, ProbeError> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    msg.encode(&mut encoder)
        .map_err(|e| ProbeError::Protocol(format!("failed to encode DHCPv6 message: {e}")))?;
    Ok(buffer)
}

/// First address of the first IA_NA in `msg`.
pub fn first_ia_address(msg: &v6::Message) -> Option<&v6::IAAddr> {
    let Some(v6::DhcpOption::IANA(ia_na)) = msg.opts().get(v6::OptionCode::IANA) else {
        return None;
    };
    match ia_na.opts.get(v6::OptionCode::IAAddr) {
        Some(v6::DhcpOption::IAAddr(addr)) => Some(addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhcproto::{Decodable, Decoder};

    const MAC: [u8; 6] = [0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4];

    fn advertise(with_server_id: bool) -> v6::Message {
        let mut msg = v6::Message::new_with_id(v6::MessageType::Advertise, [1, 2, 3]);
        if with_server_id {
            msg.opts_mut()
                .insert(v6::DhcpOption::ServerId(vec![0, 1, 2, 3].into()));
        }
        let mut ia_opts = v6::DhcpOptions::new();
        ia_opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
            addr: "2001:db8::5".parse().unwrap(),
            preferred_life: 1800,
            valid_life: 3600,
            opts: v6::DhcpOptions::new(),
        }));
        msg.opts_mut().insert(v6::DhcpOption::IANA(v6::IANA {
            id: 42,
            t1: 900,
            t2: 1400,
            opts: ia_opts,
        }));
        msg
    }

    #[test]
    fn test_duid_ll_layout() {
        let duid = duid_ll(&Bytes::from_static(&MAC));
        assert_eq!(&duid[..4], &[0, 3, 0, 1]);
        assert_eq!(&duid[4..], &MAC);
    }

    #[test]
    fn test_build_solicit_round_trips() {
        let duid = duid_ll(&Bytes::from_static(&MAC));
        let packet = encode(&build_solicit(&duid, 42, [9, 8, 7])).unwrap();
        let msg = v6::Message::decode(&mut Decoder::new(&packet)).unwrap();

        assert_eq!(msg.msg_type(), v6::MessageType::Solicit);
        assert_eq!(msg.xid(), [9, 8, 7]);
        assert!(msg.opts().get(v6::OptionCode::ClientId).is_some());
        assert!(matches!(
            msg.opts().get(v6::OptionCode::IANA),
            Some(v6::DhcpOption::IANA(ia)) if ia.id == 42
        ));
    }

    #[test]
    fn test_build_request_copies_server_and_address() {
        let duid = duid_ll(&Bytes::from_static(&MAC));
        let request = build_request(&duid, 42, [4, 5, 6], &advertise(true)).unwrap();

        assert_eq!(request.msg_type(), v6::MessageType::Request);
        assert!(request.opts().get(v6::OptionCode::ServerId).is_some());
        assert_eq!(
            first_ia_address(&request).map(|a| a.addr),
            Some("2001:db8::5".parse().unwrap())
        );
    }

    #[test]
    fn test_build_request_requires_server_id() {
        let duid = duid_ll(&Bytes::from_static(&MAC));
        assert!(matches!(
            build_request(&duid, 42, [4, 5, 6], &advertise(false)),
            Err(ProbeError::Protocol(_))
        ));
    }

    #[test]
    fn test_first_ia_address() {
        let msg = advertise(true);
        let addr = first_ia_address(&msg).unwrap();
        assert_eq!(addr.valid_life, 3600);

        let empty = v6::Message::new_with_id(v6::MessageType::Reply, [0, 0, 1]);
        assert!(first_ia_address(&empty).is_none());
    }
}
