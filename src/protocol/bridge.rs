//! Request/response correlation over one line-delimited JSON-RPC channel.
//!
//! A [`Bridge`] wraps the stdout/stdin pair of a single server process (or any
//! other `AsyncRead`/`AsyncWrite` pair). Outgoing lines are written by one
//! writer task in queue order; one reader task resolves pending calls by id.
//!
//! Every pending entry leaves the table exactly once: through its reply,
//! through the caller's deadline, or through [`Bridge::shutdown`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{correlation_id, Incoming, JsonRpcNotification, JsonRpcRequest, RpcChannel, METHOD_NOT_FOUND};
use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::utils::lock;

type Outcome = Result<Value>;

struct PendingRequest {
    method: String,
    submitted_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the bridge is closed; new calls are refused with this reason.
    closed: Option<String>,
}

struct Shared {
    server: String,
    pending: Mutex<PendingTable>,
    closed: CancellationToken,
}

impl Shared {
    fn take(&self, id: u64) -> Option<PendingRequest> {
        lock(&self.pending).entries.remove(&id)
    }

    /// Resolve every pending call with `Cancelled` and refuse new ones.
    fn close(&self, reason: &str) {
        let drained: Vec<PendingRequest> = {
            let mut table = lock(&self.pending);
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            tracing::warn!(
                "Cancelling {} pending request(s) to '{}': {}",
                drained.len(),
                self.server,
                reason
            );
        }
        for entry in drained {
            let _ = entry.slot.send(Err(BridgeError::Cancelled {
                server: self.server.clone(),
                reason: reason.to_string(),
            }));
        }
        self.closed.cancel();
    }
}

/// Limits applied to one bridge.
#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    pub default_timeout: Duration,
    pub max_in_flight: usize,
}

impl BridgeLimits {
    /// Settings-wide limits, with the server's own timeout taking precedence.
    pub fn new(settings: &BridgeSettings, server_timeout: Option<Duration>) -> Self {
        Self {
            default_timeout: server_timeout.unwrap_or_else(|| settings.default_timeout()),
            max_in_flight: settings.max_in_flight.max(1),
        }
    }
}

pub struct Bridge {
    shared: Arc<Shared>,
    limits: BridgeLimits,
    next_id: AtomicU64,
    outbound: mpsc::Sender<String>,
}

impl Bridge {
    /// Start the reader and writer tasks over `reader`/`writer`.
    pub fn spawn<R, W>(server: &str, reader: R, writer: W, limits: BridgeLimits) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            server: server.to_string(),
            pending: Mutex::new(PendingTable::default()),
            closed: CancellationToken::new(),
        });
        let (outbound, rx) = mpsc::channel::<String>(limits.max_in_flight + 16);

        tokio::spawn(write_loop(shared.clone(), writer, rx));
        tokio::spawn(read_loop(shared.clone(), reader, outbound.clone()));

        Arc::new(Self {
            shared,
            limits,
            next_id: AtomicU64::new(1),
            outbound,
        })
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    /// Send a request and wait for its reply, the deadline, or cancellation.
    ///
    /// `timeout` falls back to the bridge's default. A timeout never kills the
    /// process; a reply arriving afterwards is discarded.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.limits.default_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params)).map_err(|e| {
            BridgeError::Protocol {
                server: self.server().to_string(),
                reason: format!("failed to encode request: {e}"),
            }
        })?;

        let (slot, mut rx) = oneshot::channel();
        let submitted_at = Instant::now();
        let deadline = submitted_at + timeout;
        {
            let mut table = lock(&self.shared.pending);
            if let Some(reason) = &table.closed {
                return Err(self.cancelled(reason));
            }
            if table.entries.len() >= self.limits.max_in_flight {
                tracing::warn!(
                    "'{}' is saturated ({} in flight), rejecting {}",
                    self.server(),
                    table.entries.len(),
                    method
                );
                return Err(BridgeError::Saturated {
                    server: self.server().to_string(),
                    limit: self.limits.max_in_flight,
                });
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    submitted_at,
                    deadline,
                    slot,
                },
            );
        }
        tracing::trace!("-> '{}' #{} {}", self.server(), id, method);

        let deadline_at = tokio::time::Instant::from_std(deadline);
        match tokio::time::timeout_at(deadline_at, self.outbound.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.shared.take(id);
                return Err(self.cancelled("writer is closed"));
            }
            Err(_) => return self.expire(id, method, timeout, &mut rx),
        }

        match tokio::time::timeout_at(deadline_at, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.cancelled("request slot dropped")),
            Err(_) => self.expire(id, method, timeout, &mut rx),
        }
    }

    /// The deadline passed. Whoever removes the entry owns the outcome: if the
    /// reader or shutdown got there first, their result is delivered instead.
    fn expire(&self, id: u64, method: &str, timeout: Duration, rx: &mut oneshot::Receiver<Outcome>) -> Outcome {
        let timed_out = || BridgeError::Timeout {
            server: self.server().to_string(),
            method: method.to_string(),
            timeout,
        };
        if self.shared.take(id).is_some() {
            tracing::warn!("'{}' #{} {} timed out after {:?}", self.server(), id, method, timeout);
            return Err(timed_out());
        }
        rx.try_recv().unwrap_or_else(|_| Err(timed_out()))
    }

    /// Fire-and-forget notification through the same writer.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if let Some(reason) = self.close_reason() {
            return Err(self.cancelled(&reason));
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params)).map_err(|e| {
            BridgeError::Protocol {
                server: self.server().to_string(),
                reason: format!("failed to encode notification: {e}"),
            }
        })?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| self.cancelled("writer is closed"))
    }

    /// Cancel every pending call and close the write side. Idempotent.
    pub fn shutdown(&self, reason: &str) {
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.shared.pending).closed.clone()
    }

    /// Resolves once the bridge is closed (shutdown, EOF, or write failure).
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.shared.pending).entries.len()
    }

    fn cancelled(&self, reason: &str) -> BridgeError {
        BridgeError::Cancelled {
            server: self.server().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("server", &self.shared.server)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shared.close("bridge dropped");
    }
}

impl RpcChannel for Bridge {
    async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        Bridge::call(self, method, params, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        Bridge::notify(self, method, params).await
    }
}

// ─── Tasks ───────────────────────────────────────────────────

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = shared.closed.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        if let Err(e) = write_line(&mut writer, &line).await {
            shared.close(&format!("failed to write to server: {e}"));
            break;
        }
    }
    // Closing stdin is the polite way to ask a stdio server to exit.
    let _ = writer.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R, outbound: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let reason = loop {
        buf.clear();
        let read = tokio::select! {
            _ = shared.closed.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break "server closed its output".to_string(),
            Ok(_) => handle_line(&shared, &String::from_utf8_lossy(&buf), &outbound),
            Err(e) => break format!("failed to read server output: {e}"),
        }
    };
    tracing::warn!("Bridge to '{}' closed: {}", shared.server, reason);
    shared.close(&reason);
}

fn handle_line(shared: &Shared, line: &str, outbound: &mpsc::Sender<String>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("'{}' wrote a non-JSON line, skipping: {}", shared.server, truncate(line, 200));
            return;
        }
    };

    match Incoming::classify(value) {
        Some(Incoming::Response { id, outcome }) => {
            let entry = correlation_id(&id).and_then(|id| shared.take(id));
            let Some(entry) = entry else {
                tracing::warn!("Discarding reply from '{}' with no pending request (id {})", shared.server, id);
                return;
            };
            tracing::debug!(
                "<- '{}' {} {} in {:?}",
                shared.server,
                entry.method,
                if outcome.is_ok() { "ok" } else { "error" },
                entry.submitted_at.elapsed()
            );
            if Instant::now() > entry.deadline {
                tracing::debug!("'{}' {} replied just past its deadline", shared.server, entry.method);
            }
            let outcome = outcome.map_err(|e| e.into_bridge_error(&shared.server));
            let _ = entry.slot.send(outcome);
        }
        Some(Incoming::Request { id, method, .. }) => {
            let reply = if method == "ping" {
                json!({"jsonrpc": "2.0", "id": id, "result": {}})
            } else {
                tracing::debug!("'{}' sent unsupported request {}", shared.server, method);
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": METHOD_NOT_FOUND, "message": format!("Method not found: {method}")}
                })
            };
            if outbound.try_send(reply.to_string()).is_err() {
                tracing::warn!("Dropping reply to '{}' request {}: writer is busy", shared.server, method);
            }
        }
        Some(Incoming::Notification { method, params }) => {
            let params = params.unwrap_or(Value::Null);
            tracing::debug!("'{}' notification {}: {}", shared.server, method, params);
        }
        None => {
            tracing::warn!("'{}' wrote an unrecognised message, skipping: {}", shared.server, truncate(line, 200));
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    /// The far end of a bridge, playing the server.
    struct FakeServer {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        out: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("bridge closed stdin");
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&value.to_string()).await;
        }

        async fn send_raw(&mut self, line: &str) {
            self.out.write_all(line.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
            self.out.flush().await.unwrap();
        }

        async fn reply(&mut self, request: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
                .await;
        }
    }

    fn setup(max_in_flight: usize, timeout_ms: u64) -> (Arc<Bridge>, FakeServer) {
        let (bridge_side, server_side) = duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (server_read, server_write) = tokio::io::split(server_side);
        let bridge = Bridge::spawn(
            "fake",
            bridge_read,
            bridge_write,
            BridgeLimits {
                default_timeout: Duration::from_millis(timeout_ms),
                max_in_flight,
            },
        );
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            out: server_write,
        };
        (bridge, server)
    }

    #[tokio::test]
    async fn test_replies_out_of_order_reach_their_callers() {
        let (bridge, mut server) = setup(8, 5_000);

        let calls: Vec<_> = (0..3)
            .map(|i| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.call("tools/call", Some(json!({"n": i})), None).await })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(server.next_request().await);
        }
        // Answer in reverse order, echoing each request's payload.
        for request in requests.iter().rev() {
            server.reply(request, json!({"echo": request["params"]["n"]})).await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result["echo"], i as u64);
        }
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let (bridge, mut server) = setup(8, 5_000);
        let b = bridge.clone();
        let first = tokio::spawn(async move { b.call("a", None, None).await });
        let r1 = server.next_request().await;
        let b = bridge.clone();
        let second = tokio::spawn(async move { b.call("b", None, None).await });
        let r2 = server.next_request().await;

        assert!(r2["id"].as_u64().unwrap() > r1["id"].as_u64().unwrap());
        server.reply(&r1, json!(1)).await;
        server.reply(&r2, json!(2)).await;
        assert_eq!(first.await.unwrap().unwrap(), json!(1));
        assert_eq!(second.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_discarded() {
        let (bridge, mut server) = setup(8, 100);

        let err = {
            let b = bridge.clone();
            let call = tokio::spawn(async move { b.call("slow", None, None).await });
            let request = server.next_request().await;
            let err = call.await.unwrap().unwrap_err();
            // The late reply must not be delivered anywhere.
            server.reply(&request, json!("late")).await;
            err
        };
        assert!(matches!(err, BridgeError::Timeout { ref method, .. } if method == "slow"));
        assert_eq!(bridge.in_flight(), 0);

        // The channel still works afterwards.
        let b = bridge.clone();
        let next = tokio::spawn(async move { b.call("fast", None, Some(Duration::from_secs(5))).await });
        let request = server.next_request().await;
        server.reply(&request, json!("fresh")).await;
        assert_eq!(next.await.unwrap().unwrap(), json!("fresh"));
        assert!(!bridge.is_closed());
    }

    #[tokio::test]
    async fn test_saturation_fails_fast() {
        let (bridge, mut server) = setup(2, 5_000);
        let mut held = Vec::new();
        for _ in 0..2 {
            let b = bridge.clone();
            held.push(tokio::spawn(async move { b.call("hold", None, None).await }));
        }
        let r1 = server.next_request().await;
        let r2 = server.next_request().await;

        let err = bridge.call("extra", None, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Saturated { limit: 2, .. }));

        server.reply(&r1, json!(null)).await;
        server.reply(&r2, json!(null)).await;
        for h in held {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_eof_cancels_pending_and_refuses_new_calls() {
        let (bridge, mut server) = setup(8, 5_000);
        let b = bridge.clone();
        let call = tokio::spawn(async move { b.call("hang", None, None).await });
        let _ = server.next_request().await;
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled { .. }));
        bridge.closed().await;
        assert!(bridge.is_closed());
        assert!(matches!(
            bridge.call("after", None, None).await,
            Err(BridgeError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending() {
        let (bridge, mut server) = setup(8, 5_000);
        let b = bridge.clone();
        let call = tokio::spawn(async move { b.call("hang", None, None).await });
        let _ = server.next_request().await;

        bridge.shutdown("stopping");
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            BridgeError::Cancelled {
                server: "fake".into(),
                reason: "stopping".into()
            }
        );
        assert_eq!(bridge.close_reason().as_deref(), Some("stopping"));
        // stdin is closed once the writer stops.
        assert!(server.lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noise_and_unknown_ids_are_skipped() {
        let (bridge, mut server) = setup(8, 5_000);
        let b = bridge.clone();
        let call = tokio::spawn(async move { b.call("real", None, None).await });
        let request = server.next_request().await;

        server.send_raw("Starting server v1.2...").await;
        server.send_raw("").await;
        server.send(json!({"jsonrpc": "2.0", "id": 9999, "result": "stray"})).await;
        server.send(json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}})).await;
        server.send(json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 1}})).await;
        server.send(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})).await;
        server.reply(&request, json!("mine")).await;

        assert_eq!(call.await.unwrap().unwrap(), json!("mine"));
        assert!(!bridge.is_closed());
    }

    #[tokio::test]
    async fn test_rpc_error_reply() {
        let (bridge, mut server) = setup(8, 5_000);
        let b = bridge.clone();
        let call = tokio::spawn(async move { b.call("tools/call", None, None).await });
        let request = server.next_request().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32602, "message": "unknown tool", "data": {"tool": "x"}}}))
            .await;

        match call.await.unwrap().unwrap_err() {
            BridgeError::Rpc { code, message, data, .. } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "unknown tool");
                assert_eq!(data, Some(json!({"tool": "x"})));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_requests_get_answered() {
        let (_bridge, mut server) = setup(8, 5_000);
        server.send(json!({"jsonrpc": "2.0", "id": "p1", "method": "ping"})).await;
        let pong = server.next_request().await;
        assert_eq!(pong["id"], "p1");
        assert_eq!(pong["result"], json!({}));

        server.send(json!({"jsonrpc": "2.0", "id": 5, "method": "sampling/createMessage"})).await;
        let refused = server.next_request().await;
        assert_eq!(refused["id"], 5);
        assert_eq!(refused["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notify_writes_a_line_without_id() {
        let (bridge, mut server) = setup(8, 5_000);
        bridge.notify("notifications/initialized", None).await.unwrap();
        let line = server.next_request().await;
        assert_eq!(line["method"], "notifications/initialized");
        assert!(line.get("id").is_none());
        assert_eq!(bridge.in_flight(), 0);
    }
}
