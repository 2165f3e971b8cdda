//! Per-network policy table built from configuration.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use log::{info, warn};

use crate::command::{CommandRunner, CommandTemplate, InterfaceParams};
use crate::config::Config;
use crate::dns::{verify_host, Resolver};
use crate::error::{Error, Result};
use crate::types::{fqdn, Network};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub interface: String,
    /// Fully qualified names whose forward/reverse records round-trip.
    pub trusted_hosts: HashSet<String>,
    /// At most one controller of the cluster may announce the network.
    pub unique: bool,
    pub health_check: Option<CommandTemplate>,
}

pub type PolicyTable = HashMap<Network, NetworkPolicy>;

/// Immutable view used by a single remote call.  Replaced as a whole on
/// every reconfiguration.
#[derive(Debug, Default)]
pub struct Topology {
    pub policies: PolicyTable,
    /// Peer controllers discovered when the topology was built.
    pub peers: HashSet<IpAddr>,
    pub discovery_name: Option<String>,
    pub self_ip: Option<IpAddr>,
}

/// Builds the policy table.  Malformed prefixes fail the whole build;
/// missing interfaces and unverifiable hosts only drop the affected entry.
pub async fn build_policies(
    config: &Config,
    resolver: &dyn Resolver,
    runner: &dyn CommandRunner,
) -> Result<PolicyTable> {
    let mut parsed = Vec::with_capacity(config.networks.len());
    for (key, section) in &config.networks {
        let network: Network = key
            .parse()
            .map_err(|_| Error::Config(format!("Invalid network section '{}'", key)))?;
        if section.interface.trim().is_empty() {
            return Err(Error::Config(format!(
                "Network {} does not declare an interface",
                network
            )));
        }
        parsed.push((network, section));
    }

    let mut policies = PolicyTable::new();
    for (network, section) in parsed {
        info!("Checking network {}.", network);
        if policies.contains_key(&network) {
            warn!("Network {} is declared more than once, keeping the first.", network);
            continue;
        }
        if !interface_exists(config, runner, &section.interface).await {
            warn!(
                "Interface {} of network {} does not exist, skipping network.",
                section.interface, network
            );
            continue;
        }

        let mut trusted_hosts = HashSet::new();
        for host in &section.allowed_hosts {
            let host = fqdn(host);
            if verify_host(resolver, &host).await.is_some() {
                trusted_hosts.insert(host);
            }
        }

        let unique = !section.unicast;
        let health_check = match &section.health_check {
            Some(check) if unique => {
                warn!(
                    "Network {} is unique, ignoring its health check `{}`.",
                    network, check
                );
                None
            }
            Some(check) if check.is_empty() => None,
            other => other.clone(),
        };

        policies.insert(
            network,
            NetworkPolicy {
                interface: section.interface.clone(),
                trusted_hosts,
                unique,
                health_check,
            },
        );
    }
    Ok(policies)
}

async fn interface_exists(config: &Config, runner: &dyn CommandRunner, interface: &str) -> bool {
    let argv = config.check_interface.render(&InterfaceParams { interface });
    match runner.run(&argv).await {
        Ok(out) => out.success,
        Err(e) => {
            warn!("Cannot check interface {}: {}", interface, e);
            false
        }
    }
}
