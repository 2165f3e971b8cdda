//! JSON-RPC 2.0 envelope shared by the server and the peer client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32000;
pub const UNKNOWN_NETWORK: i64 = -32001;
pub const ACCESS_DENIED: i64 = -32003;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: &str, network: &str, id: u64) -> Self {
        Self {
            jsonrpc: Some("2.0".into()),
            method: method.into(),
            params: Value::Array(vec![Value::String(network.into())]),
            id: id.into(),
        }
    }

    /// The single network argument, given either positionally or by name.
    pub fn network_param(&self) -> Option<&str> {
        match &self.params {
            Value::Array(items) if items.len() == 1 => items[0].as_str(),
            Value::Object(map) if map.len() == 1 => map.get("network").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    pub fn from_error(id: Value, e: &Error) -> Self {
        let code = match e {
            Error::InvalidNetwork(_) => INVALID_PARAMS,
            Error::UnknownNetwork(_) => UNKNOWN_NETWORK,
            Error::AccessDenied { .. } => ACCESS_DENIED,
            _ => INTERNAL_ERROR,
        };
        Self::err(id, code, e.to_string())
    }
}
