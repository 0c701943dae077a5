//! Interface address management
//!
//! Leases are claimed on the monitored interface only for the duration of
//! one verification cycle. [`AddressManager`] is the seam the orchestrator
//! drives; [`IpCommand`] implements it with the iproute2 `ip` tool.

use super::IpFamily;
use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt, io, net::IpAddr, path::PathBuf, process::Stdio};
use thiserror::Error;
use tokio::process::Command;

/// Default location of the iproute2 binary.
pub const IP_CMD: &str = "/sbin/ip";

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Failed to run '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Unexpected address listing")]
    Listing(#[from] serde_json::Error),
}

/// An address together with its prefix length, as installed on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.address)
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[async_trait]
pub trait AddressManager: Send + Sync {
    /// Lists the addresses of `family` currently configured on `interface`.
    async fn list(&self, interface: &str, family: IpFamily) -> Result<Vec<IpAddr>, AddressError>;

    async fn add(&self, interface: &str, address: &InterfaceAddress) -> Result<(), AddressError>;

    async fn remove(&self, interface: &str, address: &InterfaceAddress)
        -> Result<(), AddressError>;
}

/// [`AddressManager`] backed by the `ip` command.
#[derive(Debug, Clone)]
pub struct IpCommand {
    binary: PathBuf,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new(IP_CMD)
    }
}

impl IpCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<String, AddressError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        tracing::debug!(command = %command, "Executing address command");

        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| AddressError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(AddressError::CommandFailed {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl AddressManager for IpCommand {
    async fn list(&self, interface: &str, family: IpFamily) -> Result<Vec<IpAddr>, AddressError> {
        let family_flag = match family {
            IpFamily::V4 => "-4",
            IpFamily::V6 => "-6",
        };
        let args = [
            "-json".to_string(),
            family_flag.to_string(),
            "address".to_string(),
            "show".to_string(),
            "dev".to_string(),
            interface.to_string(),
        ];
        let stdout = self.exec(&args).await?;
        parse_address_listing(&stdout)
    }

    async fn add(&self, interface: &str, address: &InterfaceAddress) -> Result<(), AddressError> {
        let args = [
            "address".to_string(),
            "add".to_string(),
            address.to_string(),
            "dev".to_string(),
            interface.to_string(),
        ];
        self.exec(&args).await.map(|_| ())
    }

    async fn remove(
        &self,
        interface: &str,
        address: &InterfaceAddress,
    ) -> Result<(), AddressError> {
        let args = [
            "address".to_string(),
            "del".to_string(),
            address.to_string(),
            "dev".to_string(),
            interface.to_string(),
        ];
        self.exec(&args).await.map(|_| ())
    }
}

#[derive(Deserialize)]
struct LinkAddresses {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Deserialize)]
struct AddrInfo {
    local: IpAddr,
}

/// Extracts the local addresses from `ip -json address show` output.
pub fn parse_address_listing(json: &str) -> Result<Vec<IpAddr>, AddressError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<LinkAddresses> = serde_json::from_str(json)?;
    Ok(links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .map(|info| info.local)
        .collect())
}
