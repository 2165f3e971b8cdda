use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::CommandTemplate;
use crate::error::{Error, Result};
use crate::types::IpVersion;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ipctl.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<IpAddr>,
    pub bind_port: u16,
    /// DNS name resolving to every controller of the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_name: Option<String>,
    pub install_route: CommandTemplate,
    pub verify_route: CommandTemplate,
    pub remove_route: CommandTemplate,
    pub check_interface: CommandTemplate,
    pub health_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub ipv4: DaemonConfig,
    pub ipv6: DaemonConfig,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
}

/// Files and reload command of the routing daemon for one IP version.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub announce_file: PathBuf,
    pub routes_file: PathBuf,
    pub reload: CommandTemplate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub interface: String,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// When set, many controllers may announce the network at once.
    #[serde(default)]
    pub unicast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<CommandTemplate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: None,
            bind_port: 8080,
            discovery_name: None,
            install_route: CommandTemplate::new("ip route replace {network} dev {interface}"),
            verify_route: CommandTemplate::new("ip route show {network} dev {interface}"),
            remove_route: CommandTemplate::new("ip route del {network} dev {interface}"),
            check_interface: CommandTemplate::new("ip link show {interface}"),
            health_interval_secs: 5,
            retry_interval_secs: 3,
            peer_timeout_secs: 5,
            ipv4: DaemonConfig {
                announce_file: "/var/cache/bird/announce_ipv4.conf".into(),
                routes_file: "/var/cache/bird/routes_ipv4.conf".into(),
                reload: CommandTemplate::new("birdc configure"),
            },
            ipv6: DaemonConfig {
                announce_file: "/var/cache/bird/announce_ipv6.conf".into(),
                routes_file: "/var/cache/bird/routes_ipv6.conf".into(),
                reload: CommandTemplate::new("birdc6 configure"),
            },
            networks: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("IPCTL_").split("__"))
            .extract()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Only a missing bind address is fatal; everything else has a default.
    pub fn validate(&self) -> Result<()> {
        if self.bind_ip.is_none() {
            return Err(Error::Config(
                "Bind IP is not specified inside config".into(),
            ));
        }
        for (version, daemon) in [("ipv4", &self.ipv4), ("ipv6", &self.ipv6)] {
            if daemon.reload.is_empty() {
                return Err(Error::Config(format!("{}.reload must not be empty", version)));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_ip
            .map(|ip| SocketAddr::new(ip, self.bind_port))
            .ok_or_else(|| Error::Config("Bind IP is not specified inside config".into()))
    }

    pub fn daemon(&self, version: IpVersion) -> &DaemonConfig {
        match version {
            IpVersion::V4 => &self.ipv4,
            IpVersion::V6 => &self.ipv6,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }
}

pub const EXAMPLE_CONFIG: &str = r#"# Address and port the JSON-RPC endpoint listens on
bind_ip = "10.2.0.1"
bind_port = 8080
# DNS name listing every ip controller of the cluster
discovery_name = "ip.control.services.example."

# Route commands; {network} and {interface} are substituted
install_route = "sudo ip route replace {network} dev {interface}"
verify_route = "ip route show {network} dev {interface}"
remove_route = "sudo ip route del {network} dev {interface}"
check_interface = "ip link show {interface}"

[ipv4]
announce_file = "/var/cache/bird/announce_ipv4.conf"
routes_file = "/var/cache/bird/routes_ipv4.conf"
reload = "sudo birdc configure"

[ipv6]
announce_file = "/var/cache/bird/announce_ipv6.conf"
routes_file = "/var/cache/bird/routes_ipv6.conf"
reload = "sudo birdc6 configure"

# A table dedicated to a specific IP network
[networks."10.2.0.0/24"]
interface = "lxc0"
# Hosts allowed to manage this network
allowed_hosts = ["ct1.drone1.example", "ct2.drone1.example"]

# An anycast address announced while its health check passes
[networks."10.2.1.1/32"]
interface = "lxc0"
allowed_hosts = []
unicast = true
health_check = "curl -fs http://10.2.1.1/health"
"#;
