//! JSON-RPC over HTTP for remote server definitions.
//!
//! Each call is one POST. Replies come back either as a JSON body or as a
//! `text/event-stream` body whose `data:` lines carry the JSON-RPC message.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::{
    correlation_id, introspect, Incoming, Introspection, JsonRpcNotification, JsonRpcRequest, RpcChannel,
};
use crate::config::{BridgeSettings, RemoteSpec};
use crate::error::{BridgeError, Result};
use crate::utils::lock;

pub const SESSION_HEADER: &str = "mcp-session-id";
const ERROR_BODY_LIMIT: usize = 512;

pub struct RemoteClient {
    server: String,
    url: reqwest::Url,
    headers: HeaderMap,
    http: HttpClient,
    default_timeout: Duration,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    limit: usize,
    session_id: Mutex<Option<String>>,
    introspection: Mutex<Option<Introspection>>,
}

impl RemoteClient {
    pub fn new(server: &str, spec: &RemoteSpec, http: HttpClient, settings: &BridgeSettings) -> Result<Self> {
        let protocol = |reason: String| BridgeError::Protocol {
            server: server.to_string(),
            reason,
        };
        let url = reqwest::Url::parse(&spec.url).map_err(|e| protocol(format!("invalid url: {e}")))?;
        let headers = header_map(&spec.headers).map_err(protocol)?;
        let limit = settings.max_in_flight.max(1);

        Ok(Self {
            server: server.to_string(),
            url,
            headers,
            http,
            default_timeout: spec.timeout().unwrap_or_else(|| settings.default_timeout()),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            session_id: Mutex::new(None),
            introspection: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    pub fn introspection(&self) -> Option<Introspection> {
        lock(&self.introspection).clone()
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// POST one request and return its `result`.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let _permit = self.permits.clone().try_acquire_owned().map_err(|_| BridgeError::Saturated {
            server: self.server.clone(),
            limit: self.limit,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest::new(id, method, params);
        tracing::trace!("-> '{}' #{} {} (remote)", self.server, id, method);

        let response = self
            .post(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, method, timeout))?;
        let text = self.read_body(response, method, timeout).await?;

        let reply = parse_reply(&text).ok_or_else(|| BridgeError::Protocol {
            server: self.server.clone(),
            reason: format!("no JSON-RPC reply in response to {method}"),
        })?;
        match Incoming::classify(reply) {
            Some(Incoming::Response { id: reply_id, outcome }) => {
                if correlation_id(&reply_id) != Some(id) {
                    tracing::debug!("'{}' answered #{} with id {}", self.server, id, reply_id);
                }
                outcome.map_err(|e| e.into_bridge_error(&self.server))
            }
            _ => Err(BridgeError::Protocol {
                server: self.server.clone(),
                reason: format!("unexpected message in response to {method}"),
            }),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = JsonRpcNotification::new(method, params);
        let response = self
            .post(self.default_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, method, self.default_timeout))?;
        self.read_body(response, method, self.default_timeout).await.map(|_| ())
    }

    /// Run the handshake and remember what the server reported.
    pub async fn introspect(&self, timeout: Duration) -> Result<Introspection> {
        let introspection = introspect(&self.server, self, timeout).await?;
        *lock(&self.introspection) = Some(introspection.clone());
        Ok(introspection)
    }

    /// Health probe: handshake on first contact, `ping` afterwards.
    /// Any JSON-RPC reply counts as alive.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        if self.introspection().is_none() {
            return self.introspect(timeout).await.map(|_| ());
        }
        match self.call("ping", None, Some(timeout)).await {
            Ok(_) | Err(BridgeError::Rpc { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn post(&self, timeout: Duration) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(timeout);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    async fn read_body(&self, response: reqwest::Response, method: &str, timeout: Duration) -> Result<String> {
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = lock(&self.session_id);
            if current.as_deref() != Some(session) {
                tracing::debug!("'{}' session id is now {}", self.server, session);
                *current = Some(session.to_string());
            }
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, method, timeout))?;
        if !status.is_success() {
            let mut body = text;
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(BridgeError::Remote {
                server: self.server.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(text)
    }

    fn transport_error(&self, error: reqwest::Error, method: &str, timeout: Duration) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout {
                server: self.server.clone(),
                method: method.to_string(),
                timeout,
            }
        } else if error.is_connect() {
            BridgeError::Unavailable {
                server: self.server.clone(),
                reason: error.to_string(),
            }
        } else {
            BridgeError::Io {
                server: self.server.clone(),
                reason: error.to_string(),
            }
        }
    }
}

impl RpcChannel for RemoteClient {
    async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        RemoteClient::call(self, method, params, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        RemoteClient::notify(self, method, params).await
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> std::result::Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_str(key).map_err(|e| format!("invalid header name '{key}': {e}"))?;
        let value = HeaderValue::from_str(value).map_err(|e| format!("invalid value for header '{key}': {e}"))?;
        if name == CONTENT_TYPE {
            continue;
        }
        map.insert(name, value);
    }
    Ok(map)
}

/// Find the JSON-RPC reply in a response body.
///
/// Event-stream bodies are scanned for `data:` lines; the first one holding a
/// reply wins. Anything else is parsed as a whole JSON document.
pub fn parse_reply(body: &str) -> Option<Value> {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(data.trim()) {
            if value.get("id").is_some() && (value.get("result").is_some() || value.get("error").is_some()) {
                return Some(value);
            }
        }
    }
    serde_json::from_str(body.trim()).ok()
}
