//! Route installation worker.
//!
//! Drives the kernel routing table towards the set of networks that the
//! route stores want announced.  Requests land in a pending map; a single
//! background task keeps retrying them until the install command
//! succeeds or a read-back check finds the route already present.  The
//! loop is level-triggered: each pass looks at everything still pending,
//! so a failed or interrupted install is simply picked up again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::command::{run_checked, CommandRunner, CommandTemplate, RouteParams};
use crate::types::Network;

/// Commands the installer renders for each route.
#[derive(Debug, Clone)]
pub struct RouteCommands {
    pub install: CommandTemplate,
    pub verify: CommandTemplate,
    pub remove: CommandTemplate,
}

#[derive(Default)]
struct InstallerState {
    /// Network → interface, waiting for a successful install.
    pending: HashMap<Network, String>,
    /// Network → interface, confirmed present in the routing table.
    installed: HashMap<Network, String>,
}

struct Shared {
    state: Mutex<InstallerState>,
    wake: Notify,
    running: AtomicBool,
    commands: RouteCommands,
    runner: Arc<dyn CommandRunner>,
    retry_interval: Duration,
}

pub struct RouteInstaller {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RouteInstaller {
    /// Spawns the worker task.
    pub fn start(
        commands: RouteCommands,
        runner: Arc<dyn CommandRunner>,
        retry_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(InstallerState::default()),
            wake: Notify::new(),
            running: AtomicBool::new(true),
            commands,
            runner,
            retry_interval,
        });
        let handle = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues `network` for installation unless it is already installed
    /// on the same interface.
    pub async fn request(&self, network: Network, interface: &str) {
        {
            let mut state = self.shared.state.lock().await;
            if state.installed.get(&network).map(String::as_str) == Some(interface) {
                return;
            }
            state.installed.remove(&network);
            state.pending.insert(network, interface.to_string());
        }
        debug!("Route for {} via {} requested", network, interface);
        self.shared.wake.notify_one();
    }

    /// Drops `network` from the desired set.  An installed route is
    /// deleted once, best effort; a pending one is just forgotten.
    pub async fn withdraw(&self, network: Network) {
        let installed = {
            let mut state = self.shared.state.lock().await;
            state.pending.remove(&network);
            state.installed.remove(&network)
        };
        let Some(interface) = installed else {
            return;
        };
        let argv = self.shared.commands.remove.render(&RouteParams {
            network: &network,
            interface: &interface,
        });
        match run_checked(self.shared.runner.as_ref(), &argv).await {
            Ok(_) => info!("Removed route for {} via {}", network, interface),
            Err(e) => error!("Cannot remove route for {}: {}", network, e),
        }
    }

    #[cfg(test)]
    pub async fn is_installed(&self, network: &Network) -> bool {
        self.shared.state.lock().await.installed.contains_key(network)
    }

    #[cfg(test)]
    pub async fn is_pending(&self, network: &Network) -> bool {
        self.shared.state.lock().await.pending.contains_key(network)
    }

    /// Stops the worker and waits for it to exit.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Route installer task failed: {}", e);
            }
        }
    }
}

async fn run(shared: Arc<Shared>) {
    info!("Route installer started");
    while shared.running.load(Ordering::SeqCst) {
        let pending: Vec<(Network, String)> = {
            let state = shared.state.lock().await;
            state
                .pending
                .iter()
                .map(|(n, i)| (*n, i.clone()))
                .collect()
        };

        for (network, interface) in pending {
            if install(&shared, &network, &interface).await {
                let mut state = shared.state.lock().await;
                // Skip if withdrawn or re-targeted while the command ran.
                if state.pending.get(&network) == Some(&interface) {
                    state.pending.remove(&network);
                    state.installed.insert(network, interface);
                }
            }
        }

        let idle = shared.state.lock().await.pending.is_empty();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        if idle {
            shared.wake.notified().await;
        } else {
            let _ = timeout(shared.retry_interval, shared.wake.notified()).await;
        }
    }
    info!("Route installer stopped");
}

/// Returns true once the route is known to be present.
async fn install(shared: &Shared, network: &Network, interface: &str) -> bool {
    let params = RouteParams { network, interface };
    let argv = shared.commands.install.render(&params);
    let err = match run_checked(shared.runner.as_ref(), &argv).await {
        Ok(_) => {
            info!("Installed route for {} via {}", network, interface);
            return true;
        }
        Err(e) => e,
    };

    let argv = shared.commands.verify.render(&params);
    match shared.runner.run(&argv).await {
        Ok(out) if out.success && out.stdout.lines().any(|l| !l.trim().is_empty()) => {
            info!(
                "Route for {} via {} already present ({})",
                network, interface, err
            );
            true
        }
        Ok(_) => {
            warn!("Cannot install route for {}: {}, will retry", network, err);
            false
        }
        Err(verify_err) => {
            warn!(
                "Cannot install route for {}: {}; verification failed: {}",
                network, err, verify_err
            );
            false
        }
    }
}
