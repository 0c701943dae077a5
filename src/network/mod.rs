pub mod address;

use bytes::{BufMut, Bytes, BytesMut};
use std::{
    ffi::CString,
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket},
};
use thiserror::Error;
use tokio::net::UdpSocket as TokioUdpSocket;

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to address")]
    BindSocket(#[source] io::Error),

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set multicast interface")]
    SetMulticastInterface(#[source] io::Error),

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to convert socket to TokioUdpSocket")]
    ConvertToTokio(#[source] io::Error),

    #[error("Interface '{0}' does not exist")]
    UnknownInterface(String),

    #[error("Failed to read hardware address of '{interface}'")]
    HardwareAddress {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[allow(dead_code)]
    #[error("Binding to a specific device is not implemented on this platform")]
    NotImplemented,
}

/// Address family of a lease or an interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// Returns the kernel index of `interface`.
pub fn interface_index(interface: &str) -> Result<u32, SocketError> {
    let name =
        CString::new(interface).map_err(|_| SocketError::UnknownInterface(interface.to_string()))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(SocketError::UnknownInterface(interface.to_string()));
    }
    Ok(index)
}

/// Parses a MAC address string (e.g., "0a:1b:2c:3d:4e:5f") into a `Bytes` object.
pub fn parse_mac_address(mac_str: &str) -> Result<Bytes, std::num::ParseIntError> {
    let mut bytes = BytesMut::new();
    for byte_str in mac_str.split(':') {
        if !byte_str.is_empty() {
            let byte = u8::from_str_radix(byte_str, 16)?;
            bytes.put_u8(byte);
        }
    }
    Ok(bytes.freeze())
}

/// Reads the hardware (MAC) address of `interface` from sysfs.
pub async fn hardware_address(interface: &str) -> Result<Bytes, SocketError> {
    let mac_path = format!("/sys/class/net/{}/address", interface);
    let mac_str = tokio::fs::read_to_string(&mac_path)
        .await
        .map_err(|source| SocketError::HardwareAddress {
            interface: interface.to_string(),
            source,
        })?;
    parse_mac_address(mac_str.trim()).map_err(|e| SocketError::HardwareAddress {
        interface: interface.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

/// Creates a new `tokio::net::UdpSocket` bound to a specific network device and port.
///
/// IPv4 sockets are bound to `0.0.0.0` with `SO_BROADCAST` set. IPv6 sockets
/// are bound to `[::]` and send multicast through `interface`.
#[cfg(target_os = "linux")]
pub fn new_tokio_socket_bound_to_device(
    interface: &str,
    family: IpFamily,
    port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    use socket2::{Domain, Socket, Type};
    use std::os::fd::AsRawFd;

    let (domain, addr) = match family {
        IpFamily::V4 => (Domain::IPV4, SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)),
        IpFamily::V6 => (Domain::IPV6, SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)),
    };

    let socket2 = Socket::new(domain, Type::DGRAM, None).map_err(SocketError::CreateSocket)?;

    match family {
        IpFamily::V4 => socket2
            .set_broadcast(true)
            .map_err(SocketError::SetBroadcast)?,
        IpFamily::V6 => socket2
            .set_multicast_if_v6(interface_index(interface)?)
            .map_err(SocketError::SetMulticastInterface)?,
    }

    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    // SAFETY: the descriptor is owned by `socket2` and the option value points
    // into `interface`, which outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            socket2.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    socket2.bind(&addr.into()).map_err(SocketError::BindSocket)?;

    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
pub fn new_tokio_socket_bound_to_device(
    _interface: &str,
    _family: IpFamily,
    _port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    Err(SocketError::NotImplemented)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_address() {
        let mac = parse_mac_address("00:0c:29:a8:92:f4").unwrap();
        assert_eq!(&mac[..], &[0x00, 0x0c, 0x29, 0xa8, 0x92, 0xf4]);
    }

    #[test]
    fn test_parse_mac_address_rejects_garbage() {
        assert!(parse_mac_address("zz:00").is_err());
    }

    #[test]
    fn test_ip_family_of() {
        assert_eq!(IpFamily::of(&"10.0.0.1".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of(&"fe80::1".parse().unwrap()), IpFamily::V6);
        assert_eq!(IpFamily::V6.to_string(), "IPv6");
    }

    #[test]
    fn test_unknown_interface_index() {
        assert!(matches!(
            interface_index("does-not-exist0"),
            Err(SocketError::UnknownInterface(_))
        ));
    }
}
