//! DNS lookups used for trust decisions and peer discovery.
//!
//! The controller never serves DNS; it only asks the system resolver
//! (via [hickory-resolver](https://crates.io/crates/hickory-resolver))
//! three kinds of questions:
//!
//! * forward lookups of allow-listed host names,
//! * reverse (PTR) lookups of callers and of resolved host addresses,
//! * the address set of the cluster discovery name.
//!
//! "No records" answers are reported as empty results, everything else as
//! [`Error::Dns`].

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use log::{info, warn};

use crate::error::{Error, Result};
use crate::types::fqdn;

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>>;

    /// PTR names of `addr`, fully qualified with a trailing dot.
    async fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>>;
}

pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| Error::Dns {
            name: "resolv.conf".into(),
            reason: e.to_string(),
        })?;
        Ok(Self { resolver })
    }
}

fn no_records(e: &ResolveError) -> bool {
    matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
        match self.resolver.lookup_ip(fqdn(name)).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(Error::Dns {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>> {
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => Ok(lookup.iter().map(|ptr| fqdn(&ptr.to_string())).collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(Error::Dns {
                name: addr.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Checks that `host` resolves to exactly one address whose single PTR
/// record names `host` again.  Returns the verified address.
pub async fn verify_host(resolver: &dyn Resolver, host: &str) -> Option<IpAddr> {
    let host = fqdn(host);
    let addrs = match resolver.lookup_ip(&host).await {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Cannot resolve host {}: {}, removing it from allowed hosts.", host, e);
            return None;
        }
    };
    let addr = match addrs.as_slice() {
        [] => {
            warn!("Host {} has no DNS record, removing it from allowed hosts.", host);
            return None;
        }
        [addr] => *addr,
        _ => {
            warn!(
                "Host {} resolves to multiple IP addresses, removing it from allowed hosts.",
                host
            );
            return None;
        }
    };

    let names = match resolver.reverse_lookup(addr).await {
        Ok(names) => names,
        Err(e) => {
            warn!(
                "Reverse lookup of {} ({}) failed: {}, removing it from allowed hosts.",
                addr, host, e
            );
            return None;
        }
    };
    match names.as_slice() {
        [] => {
            warn!(
                "Host's {} IP {} has no reverse DNS record, removing it from allowed hosts.",
                host, addr
            );
            None
        }
        [name] if *name == host => {
            info!("Host's {} DNS records are properly configured.", host);
            Some(addr)
        }
        [name] => {
            warn!(
                "Host {} and its reverse {} from IP {} do not match, removing it from allowed hosts.",
                host, name, addr
            );
            None
        }
        _ => {
            warn!(
                "Host's {} IP {} has many reverse records, removing it from allowed hosts.",
                host, addr
            );
            None
        }
    }
}

/// Resolves the discovery name to the set of sibling controllers,
/// excluding our own bind address.
pub async fn discover_peers(
    resolver: &dyn Resolver,
    discovery_name: &str,
    self_ip: IpAddr,
) -> Result<HashSet<IpAddr>> {
    let peers = resolver
        .lookup_ip(discovery_name)
        .await?
        .into_iter()
        .filter(|ip| *ip != self_ip)
        .collect();
    Ok(peers)
}

#[cfg(test)]
pub mod testing {
    //! In-memory [`Resolver`] for unit tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeResolver {
        forward: Mutex<HashMap<String, Vec<IpAddr>>>,
        reverse: Mutex<HashMap<IpAddr, Vec<String>>>,
    }

    impl FakeResolver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_a(&self, name: &str, addrs: &[&str]) {
            self.forward.lock().unwrap().insert(
                fqdn(name),
                addrs.iter().map(|a| a.parse().unwrap()).collect(),
            );
        }

        pub fn add_ptr(&self, addr: &str, names: &[&str]) {
            self.reverse.lock().unwrap().insert(
                addr.parse().unwrap(),
                names.iter().map(|n| fqdn(n)).collect(),
            );
        }

        /// Forward and matching reverse record for a single host.
        pub fn add_host(&self, name: &str, addr: &str) {
            self.add_a(name, &[addr]);
            self.add_ptr(addr, &[name]);
        }
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
            Ok(self
                .forward
                .lock()
                .unwrap()
                .get(&fqdn(name))
                .cloned()
                .unwrap_or_default())
        }

        async fn reverse_lookup(&self, addr: IpAddr) -> Result<Vec<String>> {
            Ok(self
                .reverse
                .lock()
                .unwrap()
                .get(&addr)
                .cloned()
                .unwrap_or_default())
        }
    }
}
