use crate::network::{address::AddressError, SocketError};
use std::{io, time::Duration};
use thiserror::Error;

/// Failure of a single probe invocation.
///
/// Probe failures never escape the orchestrator: they are counted on the
/// probe's failure metric and logged.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("I/O error")]
    Transport(#[from] io::Error),

    #[error("No reply while {stage} after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("Socket operation failed")]
    Socket(#[from] SocketError),

    #[error("Could not resolve '{target}'")]
    Resolve { target: String },

    #[error("DHCP protocol error: {0}")]
    Protocol(String),

    #[error("Handshake finished without a DHCPACK")]
    NoAckReceived,

    #[error("Handshake finished without a DHCPv6 REPLY")]
    NoReplyReceived,

    #[error("Resolver {resolver} returned an empty answer")]
    EmptyResult { resolver: String },

    #[error("Address management failed")]
    AddressManagement(#[from] AddressError),

    #[error("Failed to parse payload: {0}")]
    Parse(String),
}

/// Coarse classification of a [`ProbeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Protocol,
    EmptyResult,
    AddressManagement,
    Parse,
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) | Self::Timeout { .. } | Self::Socket(_) | Self::Resolve { .. } => {
                FailureKind::Transport
            }
            Self::Protocol(_) | Self::NoAckReceived | Self::NoReplyReceived => {
                FailureKind::Protocol
            }
            Self::EmptyResult { .. } => FailureKind::EmptyResult,
            Self::AddressManagement(_) => FailureKind::AddressManagement,
            Self::Parse(_) => FailureKind::Parse,
        }
    }
}

/// Errors that stop the agent during startup.
#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Interface '{0}' not found")]
    InterfaceInvalid(String),

    #[error("Metrics registration failed")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error")]
    Io(#[from] io::Error),
}
