//! Invocation errors shared by the bridge, the remote client and the manager.
//!
//! Every variant maps to an HTTP status and a machine-readable code so the
//! IPC handlers can return a `BridgeError` directly.

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure of a single call against a configured server.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Server '{0}' not found")]
    NotFound(String),

    #[error("Server '{server}' is unavailable: {reason}")]
    Unavailable { server: String, reason: String },

    #[error("Server '{server}' failed to start: {reason}")]
    Startup { server: String, reason: String },

    #[error("Request '{method}' to '{server}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        server: String,
        method: String,
        timeout: Duration,
    },

    #[error("Server '{server}' already has {limit} requests in flight")]
    Saturated { server: String, limit: usize },

    #[error("Request to '{server}' was cancelled: {reason}")]
    Cancelled { server: String, reason: String },

    #[error("Server '{server}' returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Remote server '{server}' answered HTTP {status}: {body}")]
    Remote {
        server: String,
        status: u16,
        body: String,
    },

    #[error("I/O error talking to '{server}': {reason}")]
    Io { server: String, reason: String },

    #[error("Protocol error from '{server}': {reason}")]
    Protocol { server: String, reason: String },
}

impl BridgeError {
    /// HTTP status code mapping
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable { .. } | Self::Startup { .. } | Self::Cancelled { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Saturated { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Rpc { .. } | Self::Remote { .. } => StatusCode::BAD_GATEWAY,
            Self::Io { .. } | Self::Protocol { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        });
        if let Self::Rpc { code, data, .. } = self {
            body["rpc_code"] = Value::from(*code);
            if let Some(data) = data {
                body["rpc_data"] = data.clone();
            }
        }
        body
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "SERVER_NOT_FOUND",
            Self::Unavailable { .. } => "SERVER_UNAVAILABLE",
            Self::Startup { .. } => "STARTUP_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Saturated { .. } => "SATURATED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Rpc { .. } => "RPC_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
        }
    }

    /// JSON-RPC error object for the raw pass-through endpoint.
    ///
    /// Server-side errors are forwarded as-is; bridge failures use the
    /// implementation-defined server error range.
    pub fn to_rpc_error(&self) -> Value {
        match self {
            Self::Rpc {
                code,
                message,
                data,
                ..
            } => {
                let mut error = serde_json::json!({ "code": code, "message": message });
                if let Some(data) = data {
                    error["data"] = data.clone();
                }
                error
            }
            Self::Timeout { .. } => serde_json::json!({
                "code": -32000,
                "message": self.to_string(),
            }),
            _ => serde_json::json!({
                "code": -32603,
                "message": self.to_string(),
                "data": { "error_code": self.error_code() },
            }),
        }
    }
}

/// Lets axum handlers return `BridgeError` directly.
impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
