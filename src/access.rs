//! Trust check for mutating calls.
//!
//! A caller may enable or disable a network if it is a peer controller,
//! or if its address reverse-resolves to exactly one name that is in the
//! network's trusted host set.  Trusted names were verified by a
//! forward/reverse round trip when the policy table was built.

use std::net::IpAddr;

use log::{debug, warn};

use crate::dns::Resolver;
use crate::error::{Error, Result};
use crate::policy::{NetworkPolicy, Topology};
use crate::types::Network;

pub async fn authorize<'a>(
    client: IpAddr,
    network: &Network,
    topology: &'a Topology,
    resolver: &dyn Resolver,
) -> Result<&'a NetworkPolicy> {
    let policy = topology.policies.get(network).ok_or_else(|| {
        debug!("Network {} requested by {} is not managed here", network, client);
        Error::UnknownNetwork(*network)
    })?;

    if topology.peers.contains(&client) {
        debug!("Peer controller {} allowed on {}", client, network);
        return Ok(policy);
    }

    let denied = || Error::AccessDenied {
        client,
        network: *network,
    };
    let names = match resolver.reverse_lookup(client).await {
        Ok(names) => names,
        Err(e) => {
            warn!("Cannot reverse resolve {}: {}, denying access to {}", client, e, network);
            return Err(denied());
        }
    };
    match names.as_slice() {
        [] => {
            warn!("IP {} has no reverse records, denying access to {}", client, network);
            Err(denied())
        }
        [name] if policy.trusted_hosts.contains(name) => Ok(policy),
        [name] => {
            warn!(
                "Client {} ({}) tried to change announcement of network {}",
                name, client, network
            );
            Err(denied())
        }
        _ => {
            warn!(
                "IP {} has multiple reverse records {:?}, denying access to {}",
                client, names, network
            );
            Err(denied())
        }
    }
}
