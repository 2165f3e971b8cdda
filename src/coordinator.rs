//! Remote-callable facade of the controller.
//!
//! The coordinator owns both route stores, the route installer and the
//! health monitors.  [`Coordinator::configure`] swaps in a new
//! [`Topology`] and reconciles the stores against it; `enable`, `disable`
//! and `status` serve callers and peer controllers.
//!
//! Uniqueness of a network across the cluster is best effort.  Before a
//! unique network is enabled locally every peer is asked to disable it,
//! but nothing stops two controllers from enabling the same network at
//! the same moment, and an unreachable peer is skipped.  The network may
//! then be announced twice until one side disables it.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::access::authorize;
use crate::command::CommandRunner;
use crate::config::Config;
use crate::dns::{discover_peers, Resolver};
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::installer::{RouteCommands, RouteInstaller};
use crate::peer::PeerClient;
use crate::policy::{build_policies, Topology};
use crate::route_store::RouteStore;
use crate::types::{IpVersion, Network, Status};

pub struct Coordinator {
    v4: Arc<RouteStore>,
    v6: Arc<RouteStore>,
    installer: Arc<RouteInstaller>,
    monitors: Mutex<Vec<HealthMonitor>>,
    topology: RwLock<Arc<Topology>>,
    /// Serialises reconfigurations.
    reconfigure: Mutex<()>,
    resolver: Arc<dyn Resolver>,
    peers: Arc<dyn PeerClient>,
    runner: Arc<dyn CommandRunner>,
}

impl Coordinator {
    /// Opens route state, starts the installer and applies `config`.
    /// File paths and route commands are fixed for the process lifetime.
    pub async fn start(
        config: &Config,
        revert: bool,
        resolver: Arc<dyn Resolver>,
        peers: Arc<dyn PeerClient>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let installer = Arc::new(RouteInstaller::start(
            RouteCommands {
                install: config.install_route.clone(),
                verify: config.verify_route.clone(),
                remove: config.remove_route.clone(),
            },
            Arc::clone(&runner),
            config.retry_interval(),
        ));

        let v4 = RouteStore::open(
            IpVersion::V4,
            config.daemon(IpVersion::V4),
            Arc::clone(&installer),
            Arc::clone(&runner),
            revert,
        )
        .await?;
        let v6 = RouteStore::open(
            IpVersion::V6,
            config.daemon(IpVersion::V6),
            Arc::clone(&installer),
            Arc::clone(&runner),
            revert,
        )
        .await?;

        let coordinator = Self {
            v4: Arc::new(v4),
            v6: Arc::new(v6),
            installer,
            monitors: Mutex::new(Vec::new()),
            topology: RwLock::new(Arc::new(Topology::default())),
            reconfigure: Mutex::new(()),
            resolver,
            peers,
            runner,
        };
        coordinator.configure(config).await?;
        Ok(coordinator)
    }

    pub fn store(&self, version: IpVersion) -> &Arc<RouteStore> {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }

    async fn topology(&self) -> Arc<Topology> {
        Arc::clone(&*self.topology.read().await)
    }

    /// Rebuilds the policy table and peer set from `config`.  On error the
    /// previous topology stays in effect.  Health monitors of the previous
    /// configuration are stopped before this returns.
    pub async fn configure(&self, config: &Config) -> Result<()> {
        let _guard = self.reconfigure.lock().await;
        info!("Configuring");

        let policies = build_policies(config, self.resolver.as_ref(), self.runner.as_ref()).await?;
        let self_ip = config.bind_ip;
        let peers = match (&config.discovery_name, self_ip) {
            (Some(name), Some(ip)) => match discover_peers(self.resolver.as_ref(), name, ip).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!("Cannot discover peer controllers: {}", e);
                    HashSet::new()
                }
            },
            _ => HashSet::new(),
        };
        info!(
            "Managing {} networks with {} peer controllers",
            policies.len(),
            peers.len()
        );

        let previous = std::mem::take(&mut *self.monitors.lock().await);
        for monitor in previous {
            monitor.stop().await;
        }

        let topology = Arc::new(Topology {
            policies,
            peers,
            discovery_name: config.discovery_name.clone(),
            self_ip,
        });
        *self.topology.write().await = Arc::clone(&topology);

        for store in [&self.v4, &self.v6] {
            let mut changed = false;
            for network in store.networks().await {
                match topology.policies.get(&network) {
                    None => {
                        info!("Removing obsolete network {}.", network);
                        changed |= store.remove(&network).await;
                    }
                    Some(policy) => changed |= store.add(network, &policy.interface).await,
                }
            }
            if changed {
                if let Err(e) = store.save().await {
                    error!("Cannot persist {} route state: {}", store.version(), e);
                }
            }
        }

        let mut monitors = Vec::new();
        for store in [&self.v4, &self.v6] {
            let checks: Vec<_> = topology
                .policies
                .iter()
                .filter(|(network, _)| network.version() == store.version())
                .filter_map(|(network, policy)| {
                    policy
                        .health_check
                        .as_ref()
                        .map(|check| (*network, policy.interface.as_str(), check.clone()))
                })
                .collect();
            if checks.is_empty() {
                continue;
            }
            let monitor = HealthMonitor::start(
                Arc::clone(store),
                Arc::clone(&self.runner),
                config.health_interval(),
            );
            for (network, interface, check) in checks {
                monitor.register(network, interface, check).await;
            }
            monitors.push(monitor);
        }
        *self.monitors.lock().await = monitors;
        Ok(())
    }

    /// Announces `network` locally, first asking every peer to withdraw it
    /// if the network is unique.
    pub async fn enable(&self, client: IpAddr, network: &str) -> Result<()> {
        let network: Network = network.parse()?;
        let topology = self.topology().await;
        let policy = authorize(client, &network, &topology, self.resolver.as_ref()).await?;

        if policy.unique {
            self.claim(&topology, &network).await;
        }

        let store = self.store(network.version());
        if store.add(network, &policy.interface).await {
            info!("Enabled network {} on request of {}", network, client);
            if let Err(e) = store.save().await {
                error!("Cannot persist {} route state: {}", store.version(), e);
            }
        }
        Ok(())
    }

    pub async fn disable(&self, client: IpAddr, network: &str) -> Result<()> {
        let network: Network = network.parse()?;
        let topology = self.topology().await;
        authorize(client, &network, &topology, self.resolver.as_ref()).await?;

        let store = self.store(network.version());
        if store.remove(&network).await {
            info!("Disabled network {} on request of {}", network, client);
            if let Err(e) = store.save().await {
                error!("Cannot persist {} route state: {}", store.version(), e);
            }
        }
        Ok(())
    }

    pub async fn status(&self, network: &str) -> Result<Status> {
        let network: Network = network.parse()?;
        if self.store(network.version()).has(&network).await {
            Ok(Status::Enabled)
        } else {
            Ok(Status::Disabled)
        }
    }

    /// Disables `network` on every peer currently announcing it.  Peers are
    /// re-discovered first; failures are logged and skipped.
    async fn claim(&self, topology: &Topology, network: &Network) {
        let peers = match (&topology.discovery_name, topology.self_ip) {
            (Some(name), Some(ip)) => match discover_peers(self.resolver.as_ref(), name, ip).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!("Cannot discover peer controllers, using last known set: {}", e);
                    topology.peers.clone()
                }
            },
            _ => topology.peers.clone(),
        };

        for peer in peers {
            match self.peers.status(peer, network).await {
                Ok(Status::Enabled) => match self.peers.disable(peer, network).await {
                    Ok(()) => info!("Disabled network {} on controller {}", network, peer),
                    Err(e) => warn!(
                        "Cannot disable network {} on controller {}: {}",
                        network, peer, e
                    ),
                },
                Ok(Status::Disabled) => debug!("Network {} not enabled on {}", network, peer),
                Err(e) => warn!(
                    "Cannot query network {} on controller {}: {}",
                    network, peer, e
                ),
            }
        }
    }

    /// Stops all background workers.
    pub async fn shutdown(&self) {
        let monitors = std::mem::take(&mut *self.monitors.lock().await);
        for monitor in monitors {
            monitor.stop().await;
        }
        self.installer.stop().await;
    }

    #[cfg(test)]
    async fn monitor_count(&self) -> usize {
        self.monitors.lock().await.len()
    }
}
