//! JSON-RPC endpoint.
//!
//! A single `POST /` route accepts JSON-RPC 2.0 requests for `enable`,
//! `disable` and `status`, each taking one network argument.  The caller
//! is identified only by the TCP source address of the connection, which
//! is what the trust check in [`crate::access`] works on.  `GET /health`
//! answers `ok` for liveness probes.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use serde_json::Value;
use tokio::net::TcpListener;

use crate::coordinator::Coordinator;
use crate::rpc::{
    RpcRequest, RpcResponse, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .route("/health", get(|| async { "ok" }))
        .with_state(coordinator)
}

/// Serves the endpoint on `listener` until `shutdown` resolves.
pub async fn run_rpc_server(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("RPC server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(coordinator).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    info!("RPC server shut down");
    Ok(())
}

async fn handle_rpc(
    State(coordinator): State<Arc<Coordinator>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Json<RpcResponse> {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Malformed request from {}: {}", remote, e);
            return Json(RpcResponse::err(Value::Null, PARSE_ERROR, e.to_string()));
        }
    };
    Json(dispatch(&coordinator, remote.ip().to_canonical(), request).await)
}

async fn dispatch(coordinator: &Coordinator, client: IpAddr, request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return RpcResponse::err(id, INVALID_REQUEST, "Unsupported JSON-RPC version");
    }
    if !matches!(request.method.as_str(), "enable" | "disable" | "status") {
        return RpcResponse::err(
            id,
            METHOD_NOT_FOUND,
            format!("Method '{}' not found", request.method),
        );
    }
    let Some(network) = request.network_param() else {
        return RpcResponse::err(id, INVALID_PARAMS, "Expected a single network parameter");
    };
    debug!("{} {} from {}", request.method, network, client);

    let result = match request.method.as_str() {
        "enable" => coordinator.enable(client, network).await.map(|()| Value::Null),
        "disable" => coordinator.disable(client, network).await.map(|()| Value::Null),
        _ => coordinator
            .status(network)
            .await
            .map(|status| Value::String(status.to_string())),
    };
    match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::FakeRunner;
    use crate::command::CommandTemplate;
    use crate::config::{Config, DaemonConfig, NetworkConfig};
    use crate::dns::testing::FakeResolver;
    use crate::peer::{HttpPeerClient, PeerClient};
    use crate::rpc::{ACCESS_DENIED, UNKNOWN_NETWORK};
    use crate::types::{Network, Status};
    use serde_json::json;
    use std::time::Duration;

    struct Server {
        _dir: tempfile::TempDir,
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        resolver: Arc<FakeResolver>,
    }

    async fn serve() -> Server {
        serve_with_peers(&[]).await
    }

    /// Serves on 127.0.0.1 with `peers` listed next to it under the
    /// discovery name.
    async fn serve_with_peers(peers: &[&str]) -> Server {
        let dir = tempfile::tempdir().unwrap();
        let daemon = |v: u8| DaemonConfig {
            announce_file: dir.path().join(format!("announce{}.conf", v)),
            routes_file: dir.path().join(format!("routes{}.conf", v)),
            reload: CommandTemplate::new("true"),
        };
        let mut config = Config {
            bind_ip: Some(localhost()),
            discovery_name: Some("ctl.example".into()),
            ipv4: daemon(4),
            ipv6: daemon(6),
            ..Config::default()
        };
        config.networks.insert(
            "10.0.0.0/24".into(),
            NetworkConfig {
                interface: "eth0".into(),
                allowed_hosts: vec!["a.example".into()],
                unicast: false,
                health_check: None,
            },
        );

        let resolver = Arc::new(FakeResolver::new());
        resolver.add_host("a.example", "127.0.0.1");
        let controllers: Vec<&str> = std::iter::once("127.0.0.1").chain(peers.iter().copied()).collect();
        resolver.add_a("ctl.example", &controllers);
        let client = Arc::new(HttpPeerClient::new(localhost(), 1, Duration::from_secs(1)).unwrap());
        let coordinator = Arc::new(
            Coordinator::start(&config, false, resolver.clone(), client, Arc::new(FakeRunner::new()))
                .await
                .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::clone(&coordinator);
        tokio::spawn(async move {
            run_rpc_server(listener, served, std::future::pending()).await.unwrap();
        });
        Server {
            _dir: dir,
            addr,
            coordinator,
            resolver,
        }
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    async fn post(addr: SocketAddr, body: Value) -> RpcResponse {
        reqwest::Client::new()
            .post(format!("http://{}/", addr))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enable_status_disable_over_http() {
        let server = serve().await;
        let client =
            HttpPeerClient::new(localhost(), server.addr.port(), Duration::from_secs(5)).unwrap();
        let local = localhost();
        let network = "10.0.0.0/24".parse().unwrap();

        assert_eq!(client.status(local, &network).await.unwrap(), Status::Disabled);

        let response = post(
            server.addr,
            json!({"jsonrpc": "2.0", "method": "enable", "params": ["10.0.0.0/24"], "id": 1}),
        )
        .await;
        assert!(response.error.is_none(), "{:?}", response.error);
        assert_eq!(response.id, json!(1));
        assert_eq!(client.status(local, &network).await.unwrap(), Status::Enabled);

        client.disable(local, &network).await.unwrap();
        assert_eq!(client.status(local, &network).await.unwrap(), Status::Disabled);
        server.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn errors_carry_codes() {
        let server = serve().await;

        let unknown = post(
            server.addr,
            json!({"method": "enable", "params": {"network": "10.9.0.0/24"}, "id": 2}),
        )
        .await;
        assert_eq!(unknown.error.unwrap().code, UNKNOWN_NETWORK);

        let missing = post(server.addr, json!({"method": "frobnicate", "params": [], "id": 3})).await;
        assert_eq!(missing.error.unwrap().code, METHOD_NOT_FOUND);

        let params = post(server.addr, json!({"method": "status", "params": [], "id": 4})).await;
        assert_eq!(params.error.unwrap().code, INVALID_PARAMS);

        let malformed = post(server.addr, json!({"method": "status", "params": ["x/99"], "id": 5})).await;
        assert_eq!(malformed.error.unwrap().code, INVALID_PARAMS);

        // Once the caller's PTR changes it is no longer trusted.
        server.resolver.add_ptr("127.0.0.1", &["stranger.example"]);
        let denied = post(
            server.addr,
            json!({"method": "enable", "params": ["10.0.0.0/24"], "id": 6}),
        )
        .await;
        assert_eq!(denied.error.unwrap().code, ACCESS_DENIED);
        server.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn peer_is_recognised_by_its_bind_address() {
        let server = serve_with_peers(&["127.0.0.2"]).await;
        let network: Network = "10.0.0.0/24".parse().unwrap();
        let enabled = post(
            server.addr,
            json!({"jsonrpc": "2.0", "method": "enable", "params": ["10.0.0.0/24"], "id": 1}),
        )
        .await;
        assert!(enabled.error.is_none(), "{:?}", enabled.error);

        // 127.0.0.2 has no PTR record; only the peer bypass lets it in.
        let peer = HttpPeerClient::new(
            "127.0.0.2".parse().unwrap(),
            server.addr.port(),
            Duration::from_secs(5),
        )
        .unwrap();
        peer.disable(localhost(), &network).await.unwrap();
        assert_eq!(
            server.coordinator.status("10.0.0.0/24").await.unwrap(),
            Status::Disabled
        );
        server.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let server = serve().await;
        let body = reqwest::get(format!("http://{}/health", server.addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");
        server.coordinator.shutdown().await;
    }
}
