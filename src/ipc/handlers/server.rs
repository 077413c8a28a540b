use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{IPCServer, InvokeRequest};
use crate::error::BridgeError;

const DEFAULT_LOG_COUNT: usize = 100;

/// GET /api/servers - every configured server
pub async fn list_servers(State(state): State<IPCServer>) -> impl IntoResponse {
    let servers = state.manager.list_servers();
    Json(json!({
        "generation": state.manager.generation(),
        "servers": servers,
    }))
}

/// GET /api/servers/:name - handle plus definition
pub async fn get_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, BridgeError> {
    Ok(Json(state.manager.server(&name)?))
}

/// POST /api/servers/:name/invoke - call one tool
pub async fn invoke(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(request): Json<InvokeRequest>,
) -> Result<impl IntoResponse, BridgeError> {
    let deadline = request.timeout_ms.map(Duration::from_millis);
    let result = state
        .manager
        .invoke(&name, &request.operation, request.payload, deadline)
        .await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

/// POST /api/servers/:name/restart
pub async fn restart(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, BridgeError> {
    let handle = state.manager.restart(&name).await?;
    Ok(Json(json!({ "success": true, "server": handle })))
}

/// POST /api/servers/:name/warm-up - start ahead of the first call
pub async fn warm_up(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, BridgeError> {
    let handle = state.manager.warm_up(&name).await?;
    Ok(Json(json!({ "success": true, "server": handle })))
}

/// POST /api/servers/:name/refresh - re-run tools/list
pub async fn refresh(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, BridgeError> {
    let tools = state.manager.refresh_capabilities(&name).await?;
    Ok(Json(json!({ "success": true, "capabilities": tools })))
}

/// GET /api/servers/:name/logs?count=100 - recent stderr lines
pub async fn logs(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let count = params
        .get("count")
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_COUNT);

    match state.manager.diagnostics(&name, count) {
        Ok(lines) => (StatusCode::OK, Json(json!({ "lines": lines }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/health-check - probe every server
pub async fn health_check(State(state): State<IPCServer>) -> impl IntoResponse {
    let servers = state.manager.health_check().await;
    let healthy = servers.values().filter(|ok| **ok).count();
    let total = servers.len();
    Json(json!({
        "servers": servers,
        "healthy": healthy,
        "total": total,
    }))
}

/// POST /api/reload - re-read configuration files
pub async fn reload(State(state): State<IPCServer>) -> impl IntoResponse {
    let summary = state.manager.reload().await;
    Json(summary)
}

/// GET /api/configurations - files that were loaded
pub async fn configurations(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(json!({
        "configurations": state.manager.configurations(),
        "warnings": state.manager.warnings(),
    }))
}
