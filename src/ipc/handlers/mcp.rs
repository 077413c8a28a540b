//! `POST /mcp/:name` - raw JSON-RPC pass-through.
//!
//! The caller's id is kept in the reply; the bridge uses its own ids on the
//! process side.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::error::BridgeError;
use crate::protocol::{INVALID_REQUEST, JSONRPC_VERSION};

const PARSE_ERROR: i64 = -32700;

pub async fn passthrough(Path(name): Path<String>, State(state): State<IPCServer>, body: Bytes) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return rpc_error(StatusCode::BAD_REQUEST, Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
        }
    };

    let id = message.get("id").cloned();
    let Some(method) = message.get("method").and_then(Value::as_str) else {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid Request: missing method".to_string(),
        );
    };
    let params = message.get("params").cloned();

    let Some(id) = id else {
        return match state.manager.notify(&name, method, params).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => e.into_response(),
        };
    };

    match state.manager.request(&name, method, params, None).await {
        Ok(result) => Json(json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })).into_response(),
        Err(e) => {
            // A server-side JSON-RPC error is a normal reply.
            let status = match &e {
                BridgeError::Rpc { .. } => StatusCode::OK,
                other => other.status_code(),
            };
            let body = json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": e.to_rpc_error() });
            (status, Json(body)).into_response()
        }
    }
}

fn rpc_error(status: StatusCode, id: Value, code: i64, message: String) -> Response {
    let body = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    });
    (status, Json(body)).into_response()
}
