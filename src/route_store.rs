//! Announced route state for one IP version.
//!
//! The store is the authority on which networks the routing daemon
//! announces.  It keeps the set in memory and renders it into two files
//! read by the daemon:
//!
//! * the announcement file, one `announce <cidr>;` line per network,
//! * the route file, one `route <cidr> via "<interface>";` line per network.
//!
//! Both files are rewritten as a whole on every [`RouteStore::save`],
//! followed by the daemon reload command.  Saves are serialised and each
//! renders the set as it is once it holds the save lock, so the last save
//! to finish always leaves the current set on disk.  Additions and
//! removals are forwarded to the [`RouteInstaller`] under the same lock
//! that guards the set change, so the installer sees them in set order.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::command::{run_checked, CommandRunner, CommandTemplate, NoParams};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::installer::RouteInstaller;
use crate::types::{IpVersion, Network};

pub struct RouteStore {
    version: IpVersion,
    announce_file: PathBuf,
    routes_file: PathBuf,
    reload: CommandTemplate,
    /// Network → interface.  Interfaces are unknown for networks recovered
    /// from an announcement file without a matching route line.
    networks: RwLock<BTreeMap<Network, Option<String>>>,
    /// Held across a set change and the matching installer call.
    changes: Mutex<()>,
    /// Held across render, both writes and the reload.
    saving: Mutex<()>,
    installer: Arc<RouteInstaller>,
    runner: Arc<dyn CommandRunner>,
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

impl RouteStore {
    /// Opens the store, recovering the announced set from disk unless
    /// `revert` is set or no announcement file exists yet.
    pub async fn open(
        version: IpVersion,
        daemon: &DaemonConfig,
        installer: Arc<RouteInstaller>,
        runner: Arc<dyn CommandRunner>,
        revert: bool,
    ) -> Result<Self> {
        let store = Self {
            version,
            announce_file: daemon.announce_file.clone(),
            routes_file: daemon.routes_file.clone(),
            reload: daemon.reload.clone(),
            networks: RwLock::new(BTreeMap::new()),
            changes: Mutex::new(()),
            saving: Mutex::new(()),
            installer,
            runner,
        };

        if revert || !store.announce_file.exists() {
            info!("Starting {} route state empty", version);
            if let Err(e) = store.save().await {
                error!("Cannot persist {} route state: {}", version, e);
            }
            return Ok(store);
        }

        let recovered = load(version, &store.announce_file, &store.routes_file).await?;
        for (network, interface) in &recovered {
            info!("Loaded network {}", network);
            if let Some(interface) = interface {
                store.installer.request(*network, interface).await;
            }
        }
        *store.networks.write().await = recovered;
        Ok(store)
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    /// Marks `network` as announced via `interface`.  Returns true if the
    /// announced set or the interface changed.
    pub async fn add(&self, network: Network, interface: &str) -> bool {
        let _changes = self.changes.lock().await;
        let previous = self
            .networks
            .write()
            .await
            .insert(network, Some(interface.to_string()));
        let previous = previous.flatten();
        if previous.as_deref() == Some(interface) {
            return false;
        }
        if previous.is_some() {
            // Re-targeted to another interface.
            self.installer.withdraw(network).await;
        }
        debug!("Announcing {} via {}", network, interface);
        self.installer.request(network, interface).await;
        true
    }

    /// Withdraws `network`.  Returns true if it was announced.
    pub async fn remove(&self, network: &Network) -> bool {
        let _changes = self.changes.lock().await;
        let removed = self.networks.write().await.remove(network).is_some();
        if removed {
            debug!("Withdrawing {}", network);
            self.installer.withdraw(*network).await;
        }
        removed
    }

    pub async fn has(&self, network: &Network) -> bool {
        self.networks.read().await.contains_key(network)
    }

    /// Snapshot of the announced set.
    pub async fn networks(&self) -> HashSet<Network> {
        self.networks.read().await.keys().copied().collect()
    }

    /// Writes both files and reloads the routing daemon.  A write failure
    /// aborts the save and leaves the previous files in place; a reload
    /// failure is only logged.
    pub async fn save(&self) -> Result<()> {
        let _saving = self.saving.lock().await;
        let (announce, routes) = {
            let networks = self.networks.read().await;
            render(&networks)
        };

        write_file(&self.announce_file, &announce).await?;
        write_file(&self.routes_file, &routes).await?;

        let argv = self.reload.render(&NoParams);
        match run_checked(self.runner.as_ref(), &argv).await {
            Ok(_) => info!("Reloaded {} routing daemon", self.version),
            Err(e) => error!(
                "Got error when reloading {} routing daemon: {}",
                self.version, e
            ),
        }
        Ok(())
    }
}

fn header() -> String {
    format!(
        "# Generated by ipctl at {}. Do not touch this file!\n",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
    )
}

/// Networks recovered without an interface get a comment in the route
/// file until the next configuration pass assigns one.
fn render(networks: &BTreeMap<Network, Option<String>>) -> (String, String) {
    let mut announce = header();
    let mut routes = header();
    for (network, interface) in networks {
        announce.push_str(&format!("announce {};\n", network));
        match interface {
            Some(interface) => {
                routes.push_str(&format!("route {} via \"{}\";\n", network, interface))
            }
            None => routes.push_str(&format!("# route {}: interface unknown\n", network)),
        }
    }
    (announce, routes)
}

/// Parses `announce <cidr>;`, ignoring anything else.
fn parse_announce(line: &str) -> Option<Network> {
    let body = line.trim().strip_prefix("announce")?.strip_suffix(';')?;
    if !body.starts_with(char::is_whitespace) {
        return None;
    }
    body.trim().parse().ok()
}

/// Parses `route <cidr> via "<interface>";`, ignoring anything else.
fn parse_route(line: &str) -> Option<(Network, String)> {
    let body = line.trim().strip_prefix("route")?.strip_suffix(';')?;
    let mut parts = body.split_whitespace();
    let network = parts.next()?.parse().ok()?;
    if parts.next()? != "via" {
        return None;
    }
    let interface = parts.next()?.strip_prefix('"')?.strip_suffix('"')?;
    if interface.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((network, interface.to_string()))
}

async fn load(
    version: IpVersion,
    announce_file: &Path,
    routes_file: &Path,
) -> Result<BTreeMap<Network, Option<String>>> {
    let content = tokio::fs::read_to_string(announce_file)
        .await
        .map_err(|e| Error::Persistence {
            path: announce_file.display().to_string(),
            source: e,
        })?;

    let mut networks: BTreeMap<Network, Option<String>> = content
        .lines()
        .filter_map(parse_announce)
        .filter(|n| n.version() == version)
        .map(|n| (n, None))
        .collect();

    match tokio::fs::read_to_string(routes_file).await {
        Ok(content) => {
            for (network, interface) in content.lines().filter_map(parse_route) {
                if let Some(slot) = networks.get_mut(&network) {
                    *slot = Some(interface);
                }
            }
        }
        Err(e) => warn!(
            "Cannot read {}: {}, interfaces of loaded networks unknown",
            routes_file.display(),
            e
        ),
    }
    Ok(networks)
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    let persist_err = |source| Error::Persistence {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
    }
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::write(&tmp, content).await.map_err(persist_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(persist_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;
    use crate::installer::RouteCommands;
    use std::time::Duration;

    fn daemon(dir: &Path) -> DaemonConfig {
        DaemonConfig {
            announce_file: dir.join("bird/announce.conf"),
            routes_file: dir.join("bird/routes.conf"),
            reload: CommandTemplate::new("birdc configure"),
        }
    }

    fn installer(runner: Arc<FakeRunner>) -> Arc<RouteInstaller> {
        Arc::new(RouteInstaller::start(
            RouteCommands {
                install: CommandTemplate::new("ip route replace {network} dev {interface}"),
                verify: CommandTemplate::new("ip route show {network} dev {interface}"),
                remove: CommandTemplate::new("ip route del {network} dev {interface}"),
            },
            runner,
            Duration::from_secs(60),
        ))
    }

    async fn open(dir: &Path, runner: Arc<FakeRunner>, revert: bool) -> RouteStore {
        RouteStore::open(
            IpVersion::V4,
            &daemon(dir),
            installer(runner.clone()),
            runner,
            revert,
        )
        .await
        .unwrap()
    }

    fn net(s: &str) -> Network {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn fresh_store_writes_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;

        assert!(store.networks().await.is_empty());
        let announce = std::fs::read_to_string(dir.path().join("bird/announce.conf")).unwrap();
        assert!(announce.starts_with("# Generated by ipctl"));
        assert_eq!(runner.count("birdc configure"), 1);
    }

    #[tokio::test]
    async fn add_and_remove_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner, false).await;

        assert!(store.add(net("10.0.0.0/24"), "eth0").await);
        assert!(!store.add(net("10.0.0.0/24"), "eth0").await);
        assert!(store.has(&net("10.0.0.0/24")).await);

        assert!(store.remove(&net("10.0.0.0/24")).await);
        assert!(!store.remove(&net("10.0.0.0/24")).await);
        assert!(!store.has(&net("10.0.0.0/24")).await);
    }

    #[tokio::test]
    async fn save_renders_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;

        store.add(net("10.0.0.0/24"), "eth0").await;
        store.add(net("10.0.1.1/32"), "lxc0").await;
        store.save().await.unwrap();

        let announce = std::fs::read_to_string(dir.path().join("bird/announce.conf")).unwrap();
        assert!(announce.contains("announce 10.0.0.0/24;\n"));
        assert!(announce.contains("announce 10.0.1.1/32;\n"));
        let routes = std::fs::read_to_string(dir.path().join("bird/routes.conf")).unwrap();
        assert!(routes.contains("route 10.0.0.0/24 via \"eth0\";\n"));
        assert!(routes.contains("route 10.0.1.1/32 via \"lxc0\";\n"));
        assert_eq!(runner.count("birdc configure"), 2);
    }

    #[tokio::test]
    async fn reopen_recovers_saved_set() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;
        store.add(net("10.0.0.0/24"), "eth0").await;
        store.add(net("10.9.0.0/16"), "lxc0").await;
        store.save().await.unwrap();
        let saved = store.networks().await;

        let reopened = open(dir.path(), runner.clone(), false).await;
        assert_eq!(reopened.networks().await, saved);

        // Recovered interfaces survive another save.
        reopened.save().await.unwrap();
        let routes = std::fs::read_to_string(dir.path().join("bird/routes.conf")).unwrap();
        assert!(routes.contains("route 10.9.0.0/16 via \"lxc0\";"));
    }

    #[tokio::test]
    async fn revert_discards_saved_set() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;
        store.add(net("10.0.0.0/24"), "eth0").await;
        store.save().await.unwrap();

        let reverted = open(dir.path(), runner, true).await;
        assert!(reverted.networks().await.is_empty());
    }

    #[tokio::test]
    async fn reload_failure_does_not_fail_save() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;
        runner.fail("birdc configure", 1);
        store.add(net("10.0.0.0/24"), "eth0").await;
        assert!(store.save().await.is_ok());
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner.clone(), false).await;
        // Replace the target file with a directory so the rename fails.
        std::fs::remove_file(dir.path().join("bird/announce.conf")).unwrap();
        std::fs::create_dir(dir.path().join("bird/announce.conf")).unwrap();

        store.add(net("10.0.0.0/24"), "eth0").await;
        assert!(matches!(store.save().await, Err(Error::Persistence { .. })));
        assert!(store.has(&net("10.0.0.0/24")).await);
        assert_eq!(runner.count("birdc configure"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_leave_current_set_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = Arc::new(open(dir.path(), runner, false).await);

        for round in 0..10u8 {
            let tasks: Vec<_> = (0..16u8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let network = net(&format!("10.{}.{}.0/24", round, i));
                    tokio::spawn(async move {
                        store.add(network, "eth0").await;
                        store.save().await
                    })
                })
                .collect();
            for task in tasks {
                assert!(task.await.unwrap().is_ok());
            }

            let announce =
                std::fs::read_to_string(dir.path().join("bird/announce.conf")).unwrap();
            let on_disk: HashSet<Network> = announce.lines().filter_map(parse_announce).collect();
            assert_eq!(on_disk, store.networks().await, "round {}", round);
        }
        let leftovers = std::fs::read_dir(dir.path().join("bird")).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn installer_follows_interleaved_changes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = Arc::new(open(dir.path(), runner, false).await);
        let network = net("10.0.0.0/24");

        for round in 0..20 {
            let tasks: Vec<_> = (0..9)
                .map(|i| {
                    let store = Arc::clone(&store);
                    tokio::spawn(async move {
                        match i % 3 {
                            0 => {
                                store.add(network, "eth0").await;
                            }
                            1 => {
                                store.add(network, "eth1").await;
                            }
                            _ => {
                                store.remove(&network).await;
                            }
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let announced = store.has(&network).await;
            let routed = store.installer.is_pending(&network).await
                || store.installer.is_installed(&network).await;
            assert_eq!(announced, routed, "round {}", round);
        }
    }

    #[tokio::test]
    async fn recovered_network_without_interface_is_noted_in_route_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bird")).unwrap();
        std::fs::write(
            dir.path().join("bird/announce.conf"),
            "announce 10.0.0.0/24;\n",
        )
        .unwrap();
        let runner = Arc::new(FakeRunner::new());
        let store = open(dir.path(), runner, false).await;
        assert!(store.has(&net("10.0.0.0/24")).await);

        store.save().await.unwrap();
        let routes = std::fs::read_to_string(dir.path().join("bird/routes.conf")).unwrap();
        assert!(routes.contains("# route 10.0.0.0/24: interface unknown\n"));
        assert!(routes.lines().filter_map(parse_route).next().is_none());
    }

    #[test]
    fn parser_ignores_foreign_lines() {
        assert_eq!(parse_announce("announce 10.0.0.0/24;"), Some(net("10.0.0.0/24")));
        assert_eq!(parse_announce("  announce 10.0.0.5/24 ;"), Some(net("10.0.0.0/24")));
        assert_eq!(parse_announce("# announce 10.0.0.0/24;"), None);
        assert_eq!(parse_announce("announce10.0.0.0/24;"), None);
        assert_eq!(parse_announce("stubnet 10.0.0.0/24;"), None);
        assert_eq!(
            parse_route("route 10.0.0.0/24 via \"eth0\";"),
            Some((net("10.0.0.0/24"), "eth0".to_string()))
        );
        assert_eq!(parse_route("route 10.0.0.0/24 via eth0;"), None);
    }
}
