//! Error types shared by the controller subsystems.

use std::net::IpAddr;

use thiserror::Error;

use crate::types::Network;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A string that does not parse as a CIDR prefix.
    #[error("Invalid network '{0}'")]
    InvalidNetwork(String),

    /// The prefix is not managed by this controller.
    #[error("Network {0} not known at this controller")]
    UnknownNetwork(Network),

    #[error("Access denied for {client} on network {network}")]
    AccessDenied { client: IpAddr, network: Network },

    #[error("DNS lookup for {name} failed: {reason}")]
    Dns { name: String, reason: String },

    /// An external command could not be started or exited non-zero.
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// A peer controller could not be reached or answered with an error.
    #[error("Peer {peer} failed: {reason}")]
    Peer { peer: IpAddr, reason: String },

    #[error("Cannot persist {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
