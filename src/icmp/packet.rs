use crate::network::IpFamily;
use bytes::{BufMut, BytesMut};

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;

const HEADER_LEN: usize = 8;
const PAYLOAD: &[u8] = b"link-observer echo probe";

/// Identifier and sequence number of a received echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub identifier: u16,
    pub sequence: u16,
}

/// Internet checksum (RFC 1071).
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds an echo request.
///
/// ICMPv6 checksums cover a pseudo header and are filled in by the kernel,
/// so the field is only computed for IPv4.
pub fn build_echo_request(family: IpFamily, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(HEADER_LEN + PAYLOAD.len());
    packet.put_u8(match family {
        IpFamily::V4 => ECHO_REQUEST_V4,
        IpFamily::V6 => ECHO_REQUEST_V6,
    });
    packet.put_u8(0); // code
    packet.put_u16(0); // checksum
    packet.put_u16(identifier);
    packet.put_u16(sequence);
    packet.extend_from_slice(PAYLOAD);

    if family == IpFamily::V4 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet.to_vec()
}

/// Parses a datagram read from a raw ICMP socket.
///
/// IPv4 raw sockets deliver the IP header too, it is skipped here. Anything
/// that is not an echo reply yields `None`.
pub fn parse_echo_reply(family: IpFamily, datagram: &[u8]) -> Option<EchoReply> {
    let (icmp, reply_type) = match family {
        IpFamily::V4 => {
            let header_len = usize::from(datagram.first()? & 0x0f) * 4;
            (datagram.get(header_len..)?, ECHO_REPLY_V4)
        }
        IpFamily::V6 => (datagram, ECHO_REPLY_V6),
    };
    if icmp.len() < HEADER_LEN || icmp[0] != reply_type || icmp[1] != 0 {
        return None;
    }
    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}
