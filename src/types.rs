//! Value types used throughout the controller.
//!
//! A [`Network`] is the unit of announcement: a normalised CIDR prefix
//! tagged with its IP version.  Networks are compared by their
//! normalised prefix, so `10.0.0.7/24` and `10.0.0.0/24` are the same
//! network.  [`Status`] is the answer to the remote `status` call and is
//! serialised as the lower-case strings `"enabled"` / `"disabled"`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// IP version of a [`Network`]; every version has its own route store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.number())
    }
}

/// A CIDR prefix under management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Network(IpNet);

impl Network {
    pub fn new(net: IpNet) -> Self {
        Self(net.trunc())
    }

    pub fn version(&self) -> IpVersion {
        match self.0 {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    /// Accepts CIDR notation as well as a bare address, which is taken
    /// as a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(Network::new(net));
        }
        s.parse::<IpAddr>()
            .map(|addr| Network::new(IpNet::from(addr)))
            .map_err(|_| Error::InvalidNetwork(s.to_string()))
    }
}

impl TryFrom<String> for Network {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Network> for String {
    fn from(network: Network) -> Self {
        network.to_string()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Announcement state of a network on one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Enabled,
    Disabled,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Enabled => f.write_str("enabled"),
            Status::Disabled => f.write_str("disabled"),
        }
    }
}

/// Normalises a host name to lower-case, fully-qualified form.
pub fn fqdn(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.ends_with('.') {
        name
    } else {
        format!("{}.", name)
    }
}
