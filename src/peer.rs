//! Calls to sibling controllers.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::rpc::{RpcRequest, RpcResponse};
use crate::types::{Network, Status};

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn status(&self, peer: IpAddr, network: &Network) -> Result<Status>;
    async fn disable(&self, peer: IpAddr, network: &Network) -> Result<()>;
}

/// JSON-RPC over HTTP; every controller listens on the same port.
/// Connections leave from our bind address, which is how peers recognise
/// each other.
pub struct HttpPeerClient {
    client: reqwest::Client,
    port: u16,
    next_id: AtomicU64,
}

impl HttpPeerClient {
    pub fn new(local: IpAddr, port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .local_address(local)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, peer: IpAddr, method: &str, network: &Network) -> Result<Value> {
        let url = format!("http://{}/", SocketAddr::new(peer, self.port));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, &network.to_string(), id);
        let peer_err = |reason: String| Error::Peer { peer, reason };

        let response: RpcResponse = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| peer_err(e.to_string()))?
            .error_for_status()
            .map_err(|e| peer_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| peer_err(format!("malformed response: {}", e)))?;

        match response.error {
            Some(e) => Err(peer_err(format!("{} ({})", e.message, e.code))),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn status(&self, peer: IpAddr, network: &Network) -> Result<Status> {
        let result = self.call(peer, "status", network).await?;
        serde_json::from_value(result).map_err(|e| Error::Peer {
            peer,
            reason: format!("unexpected status: {}", e),
        })
    }

    async fn disable(&self, peer: IpAddr, network: &Network) -> Result<()> {
        self.call(peer, "disable", network).await.map(|_| ())
    }
}
