/// HTTP surface tests. Requests go straight into the router, no socket.
mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{echo_server, fast_settings, Workspace};
use mcp_bridge::ipc::IPCServer;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup(ws: &Workspace) -> (Router, Arc<mcp_bridge::Manager>) {
    ws.write_agent(
        "default.json",
        json!({ "echo": echo_server(&[]), "broken": { "command": "/definitely/not/a/binary" } }),
    );
    let manager = ws.manager(fast_settings());
    manager.load_configurations().await;
    let router = IPCServer::new(manager.clone(), "127.0.0.1:0").router();
    (router, manager)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_list_and_get_servers() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let (status, body) = send(&router, "GET", "/api/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], 1);
    let names: Vec<&str> = body["servers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["broken", "echo"]);

    let (status, body) = send(&router, "GET", "/api/servers/echo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "echo");
    assert_eq!(body["transport"], "process");
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["scope"], "global");
    assert_eq!(body["definition"]["command"], common::ECHO_TOOL);

    let (status, body) = send(&router, "GET", "/api/servers/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "SERVER_NOT_FOUND");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_invoke_endpoint() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/servers/echo/invoke",
        Some(json!({ "operation": "echo", "payload": { "x": 42 } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["echo"]["x"], 42);

    let (status, body) = send(
        &router,
        "POST",
        "/api/servers/echo/invoke",
        Some(json!({ "operation": "echo", "payload": { "delay_ms": 1_000 }, "timeout_ms": 50 })),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &router,
        "POST",
        "/api/servers/broken/invoke",
        Some(json!({ "operation": "echo" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_mcp_passthrough_keeps_caller_id() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let (status, body) = send(
        &router,
        "POST",
        "/mcp/echo",
        Some(json!({ "jsonrpc": "2.0", "id": "abc", "method": "tools/list" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "abc");
    assert_eq!(body["result"]["tools"].as_array().unwrap().len(), 4);

    // Server-side JSON-RPC errors are relayed as they are.
    let (status, body) = send(
        &router,
        "POST",
        "/mcp/echo",
        Some(json!({ "jsonrpc": "2.0", "id": 9, "method": "resources/list" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 9);
    assert_eq!(body["error"]["code"], -32601);

    let (status, _) = send(
        &router,
        "POST",
        "/mcp/echo",
        Some(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&router, "POST", "/mcp/echo", Some(json!({ "jsonrpc": "2.0", "id": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32600);

    let (status, body) = send(
        &router,
        "POST",
        "/mcp/missing",
        Some(json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["id"], 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_passthrough_body() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp/echo")
        .body(Body::from("{ not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_reload_and_logs() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let (status, body) = send(&router, "GET", "/api/health-check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["servers"]["echo"], true);
    assert_eq!(body["servers"]["broken"], false);
    assert_eq!(body["healthy"], 1);
    assert_eq!(body["total"], 2);

    let (status, body) = send(&router, "GET", "/api/servers/echo/logs?count=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["lines"].as_array().unwrap().len() <= 5);

    ws.write_agent("default.json", json!({ "echo": echo_server(&[]) }));
    let (status, body) = send(&router, "POST", "/api/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], 2);
    assert_eq!(body["removed"], json!(["broken"]));
    assert_eq!(body["unchanged"], json!(["echo"]));

    let (status, body) = send(&router, "GET", "/api/configurations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configurations"].as_array().unwrap().len(), 1);
    assert_eq!(body["configurations"][0]["servers"], json!(["echo"]));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_restart_and_refresh_endpoints() {
    let ws = Workspace::new();
    let (router, manager) = setup(&ws).await;

    let (status, body) = send(&router, "POST", "/api/servers/echo/warm-up", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"]["state"], "ready");
    let first_pid = body["server"]["pid"].clone();

    let (status, body) = send(&router, "POST", "/api/servers/echo/restart", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"]["state"], "ready");
    assert_ne!(body["server"]["pid"], first_pid);

    let (status, body) = send(&router, "POST", "/api/servers/echo/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["capabilities"], json!(["echo", "sleep", "stderr", "exit"]));

    manager.shutdown().await;
}
