pub mod bridge;
pub mod remote;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC method not found
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC invalid request
pub const INVALID_REQUEST: i64 = -32600;

/// 클라이언트 → 서버 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// id 없는 단방향 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn into_bridge_error(self, server: &str) -> BridgeError {
        BridgeError::Rpc {
            server: server.to_string(),
            code: self.code,
            message: self.message,
            data: self.data,
        }
    }
}

/// A message read from a server, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response {
        id: Value,
        outcome: std::result::Result<Value, JsonRpcErrorObject>,
    },
    /// Server-to-client request; expects a reply with the same id.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classify a decoded JSON value. Returns `None` for anything that is not
    /// a JSON-RPC object (arrays, scalars, objects without method or result).
    pub fn classify(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };
        let id = map.remove("id");
        let method = map
            .remove("method")
            .and_then(|m| m.as_str().map(str::to_string));

        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request {
                id,
                method,
                params: map.remove("params"),
            }),
            (None, Some(method)) => Some(Self::Notification {
                method,
                params: map.remove("params"),
            }),
            (Some(id), None) => {
                if let Some(error) = map.remove("error") {
                    let error = serde_json::from_value(error).unwrap_or_else(|e| JsonRpcErrorObject {
                        code: INVALID_REQUEST,
                        message: format!("malformed error object: {e}"),
                        data: None,
                    });
                    Some(Self::Response {
                        id,
                        outcome: Err(error),
                    })
                } else {
                    map.remove("result").map(|result| Self::Response {
                        id,
                        outcome: Ok(result),
                    })
                }
            }
            (None, None) => None,
        }
    }
}

/// Correlation id as sent by us. Servers that echo numeric ids as strings
/// are tolerated.
pub fn correlation_id(id: &Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

/// What a server told us about itself during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Introspection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    pub tools: Vec<String>,
}

/// A channel that can carry JSON-RPC calls to one server.
#[allow(async_fn_in_trait)]
pub trait RpcChannel {
    async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// `initialize`, `notifications/initialized`, then `tools/list`.
///
/// Only `initialize` must succeed; a failed `tools/list` leaves the tool
/// summary empty.
pub async fn introspect<C: RpcChannel>(server: &str, channel: &C, timeout: Duration) -> Result<Introspection> {
    let init = channel
        .call("initialize", Some(initialize_params()), Some(timeout))
        .await?;

    let mut introspection = Introspection {
        server_name: init["serverInfo"]["name"].as_str().map(str::to_string),
        server_version: init["serverInfo"]["version"].as_str().map(str::to_string),
        protocol_version: init["protocolVersion"].as_str().map(str::to_string),
        tools: Vec::new(),
    };

    channel.notify("notifications/initialized", None).await?;

    match channel.call("tools/list", None, Some(timeout)).await {
        Ok(result) => introspection.tools = tool_names(&result),
        Err(e) => tracing::warn!("tools/list failed for '{}': {}", server, e),
    }

    Ok(introspection)
}

pub fn tool_names(result: &Value) -> Vec<String> {
    result["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
