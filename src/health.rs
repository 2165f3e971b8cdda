//! Health-check driven announcement of shared networks.
//!
//! A monitor is paired with one [`RouteStore`].  Every interval it runs
//! the check command of each registered network and toggles the network
//! in the store on pass/fail transitions.  The announced state is never
//! cached here: presence in the store is the status.  All transitions of
//! one pass are persisted with a single save.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::command::{CommandRunner, CommandTemplate, RouteParams};
use crate::route_store::RouteStore;
use crate::types::Network;

#[derive(Debug, Clone)]
struct Check {
    interface: String,
    command: CommandTemplate,
}

struct Shared {
    registry: Mutex<HashMap<Network, Check>>,
    wake: Notify,
    running: AtomicBool,
    store: Arc<RouteStore>,
    runner: Arc<dyn CommandRunner>,
    interval: Duration,
}

pub struct HealthMonitor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn start(
        store: Arc<RouteStore>,
        runner: Arc<dyn CommandRunner>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            running: AtomicBool::new(true),
            store,
            runner,
            interval,
        });
        let handle = tokio::spawn(run(Arc::clone(&shared)));
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Adds or replaces the check of `network` and triggers a pass.
    pub async fn register(&self, network: Network, interface: &str, command: CommandTemplate) {
        self.shared.registry.lock().await.insert(
            network,
            Check {
                interface: interface.to_string(),
                command,
            },
        );
        self.shared.wake.notify_one();
    }

    /// Asks the worker to exit and waits until it has.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Health monitor task failed: {}", e);
            }
        }
    }
}

async fn run(shared: Arc<Shared>) {
    let version = shared.store.version();
    info!("{} health monitor started", version);
    while shared.running.load(Ordering::SeqCst) {
        let checks: Vec<(Network, Check)> = {
            let registry = shared.registry.lock().await;
            registry.iter().map(|(n, c)| (*n, c.clone())).collect()
        };

        let results = join_all(checks.iter().map(|(network, check)| {
            let shared = &shared;
            async move { (network, check, probe(shared, network, check).await) }
        }))
        .await;

        // Registry and configuration may be gone by now; do not touch the
        // store from a stopped monitor.
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let mut changed = false;
        for (network, check, healthy) in results {
            let announced = shared.store.has(network).await;
            if healthy && !announced {
                info!("Network {} is healthy, enabling", network);
                shared.store.add(*network, &check.interface).await;
                changed = true;
            } else if !healthy && announced {
                warn!("Network {} failed its health check, disabling", network);
                shared.store.remove(network).await;
                changed = true;
            }
        }
        if changed {
            if let Err(e) = shared.store.save().await {
                error!("Cannot persist {} route state: {}", version, e);
            }
        }

        let _ = timeout(shared.interval, shared.wake.notified()).await;
    }
    info!("{} health monitor stopped", version);
}

async fn probe(shared: &Shared, network: &Network, check: &Check) -> bool {
    let argv = check.command.render_shell(&RouteParams {
        network,
        interface: &check.interface,
    });
    // A check gets at most one interval; the child is killed when dropped.
    match timeout(shared.interval, shared.runner.run(&argv)).await {
        Ok(Ok(out)) => {
            debug!(
                "Health check of {} exited with {:?}",
                network, out.code
            );
            out.success
        }
        Ok(Err(e)) => {
            warn!("Cannot run health check of {}: {}", network, e);
            false
        }
        Err(_) => {
            warn!(
                "Health check of {} did not finish within {:?}",
                network, shared.interval
            );
            false
        }
    }
}
