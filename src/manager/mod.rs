//! The server directory and request router.
//!
//! The directory is an immutable snapshot behind an `Arc`, replaced wholesale
//! on reload. Readers clone the `Arc` and never block on a process. Health
//! results live in a separate table that only the manager writes.

pub mod handle;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::config::{
    ConfigLoader, ConfigWarning, ConfigurationSource, ResolvedDefinition, ScopeRoots, ServerDefinition, Settings,
    Transport,
};
use crate::error::{BridgeError, Result};
use crate::protocol::remote::RemoteClient;
use crate::supervisor::process::LogLine;
use crate::supervisor::Supervisor;
use crate::utils::current_timestamp;
pub use handle::{HealthRecord, Liveness, ReloadSummary, ServerDetail, ServerHandle};

/// How a configured server is reached.
#[derive(Clone)]
pub enum Endpoint {
    Process(Arc<Supervisor>),
    Remote(Arc<RemoteClient>),
}

impl Endpoint {
    async fn call(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        match self {
            Self::Process(supervisor) => supervisor.call(method, params, timeout).await,
            Self::Remote(client) => client.call(method, params, timeout).await,
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        match self {
            Self::Process(supervisor) => {
                let bridge = supervisor.ensure_ready().await?;
                bridge.notify(method, params).await
            }
            Self::Remote(client) => client.notify(method, params).await,
        }
    }

    /// Probe liveness; returns the tool list when one is known.
    async fn probe(&self, timeout: Duration) -> Result<Option<Vec<String>>> {
        match self {
            Self::Process(supervisor) => {
                supervisor.probe().await?;
                Ok(supervisor.status().introspection.map(|i| i.tools))
            }
            Self::Remote(client) => {
                client.probe(timeout).await?;
                Ok(client.introspection().map(|i| i.tools))
            }
        }
    }

    async fn refresh(&self, timeout: Duration) -> Result<Vec<String>> {
        match self {
            Self::Process(supervisor) => supervisor.refresh_capabilities().await,
            Self::Remote(client) => client.introspect(timeout).await.map(|i| i.tools),
        }
    }

    async fn retire(&self) {
        if let Self::Process(supervisor) = self {
            supervisor.dispose().await;
        }
    }

    fn same_as(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Self::Process(a), Self::Process(b)) => Arc::ptr_eq(a, b),
            (Self::Remote(a), Self::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

struct Route {
    resolved: ResolvedDefinition,
    endpoint: Endpoint,
}

#[derive(Default)]
struct Directory {
    generation: u64,
    routes: BTreeMap<String, Arc<Route>>,
    sources: Vec<ConfigurationSource>,
    warnings: Vec<ConfigWarning>,
}

pub struct Manager {
    settings: Settings,
    loader: ConfigLoader,
    http: HttpClient,
    directory: RwLock<Arc<Directory>>,
    health: RwLock<HashMap<String, HealthRecord>>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl Manager {
    /// Manager reading configuration from the scope roots in `settings`.
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let roots = settings.scopes.roots();
        Self::with_roots(settings, roots)
    }

    pub fn with_roots(settings: Settings, roots: ScopeRoots) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;
        tracing::info!(
            "Configuration roots: global={:?} project={:?}",
            roots.global,
            roots.project
        );
        Ok(Self {
            settings,
            loader: ConfigLoader::new(roots),
            http,
            directory: RwLock::new(Arc::new(Directory::default())),
            health: RwLock::new(HashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    // ─── Configuration ───────────────────────────────────────

    /// Load (or reload) every configuration file and swap in the new directory.
    ///
    /// Unchanged definitions keep their running endpoint. Removed and changed
    /// ones are shut down after the new directory is visible.
    pub async fn load_configurations(&self) -> ReloadSummary {
        let _guard = self.reload_lock.lock().await;

        let loader = self.loader.clone();
        let loaded = match tokio::task::spawn_blocking(move || loader.load_all()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!("Configuration load task failed: {}", e);
                let current = self.snapshot();
                return ReloadSummary {
                    generation: current.generation,
                    unchanged: current.routes.keys().cloned().collect(),
                    warnings: vec![ConfigWarning {
                        path: Default::default(),
                        message: format!("configuration load failed: {e}"),
                    }],
                    ..Default::default()
                };
            }
        };

        let current = self.snapshot();
        let mut summary = ReloadSummary {
            generation: current.generation + 1,
            warnings: loaded.warnings.clone(),
            ..Default::default()
        };
        let mut routes = BTreeMap::new();
        let mut retired = Vec::new();
        let mut fresh = Vec::new();

        for (name, resolved) in loaded.definitions {
            let endpoint = match current.routes.get(&name) {
                Some(existing) if existing.resolved.definition == resolved.definition => {
                    summary.unchanged.push(name.clone());
                    if let Endpoint::Process(supervisor) = &existing.endpoint {
                        supervisor.reset_budget();
                    }
                    existing.endpoint.clone()
                }
                existing => {
                    let endpoint = match self.build_endpoint(&resolved.definition) {
                        Ok(endpoint) => endpoint,
                        Err(e) => {
                            tracing::warn!("Skipping server '{}': {}", name, e);
                            summary.warnings.push(ConfigWarning {
                                path: resolved.origin.clone(),
                                message: e.to_string(),
                            });
                            if let Some(existing) = existing {
                                retired.push(existing.endpoint.clone());
                                summary.removed.push(name.clone());
                            }
                            continue;
                        }
                    };
                    if let Some(existing) = existing {
                        retired.push(existing.endpoint.clone());
                        summary.changed.push(name.clone());
                    } else {
                        summary.added.push(name.clone());
                    }
                    fresh.push(endpoint.clone());
                    endpoint
                }
            };
            routes.insert(name, Arc::new(Route { resolved, endpoint }));
        }

        for (name, route) in &current.routes {
            if !routes.contains_key(name) && !summary.removed.contains(name) {
                summary.removed.push(name.clone());
                retired.push(route.endpoint.clone());
            }
        }

        *write(&self.directory) = Arc::new(Directory {
            generation: summary.generation,
            routes,
            sources: loaded.sources,
            warnings: summary.warnings.clone(),
        });
        {
            let mut health = write(&self.health);
            for name in summary.removed.iter().chain(summary.changed.iter()) {
                health.remove(name);
            }
        }

        tracing::info!(
            "Configuration generation {}: {} added, {} removed, {} changed, {} unchanged, {} warning(s)",
            summary.generation,
            summary.added.len(),
            summary.removed.len(),
            summary.changed.len(),
            summary.unchanged.len(),
            summary.warnings.len()
        );

        retire_all(retired).await;

        if self.settings.supervisor.eager_start {
            for endpoint in fresh {
                if let Endpoint::Process(supervisor) = endpoint {
                    tokio::spawn(async move {
                        if let Err(e) = supervisor.warm_up().await {
                            tracing::warn!("Eager start of '{}' failed: {}", supervisor.name(), e);
                        }
                    });
                }
            }
        }

        summary
    }

    pub async fn reload(&self) -> ReloadSummary {
        self.load_configurations().await
    }

    fn build_endpoint(&self, definition: &ServerDefinition) -> Result<Endpoint> {
        Ok(match &definition.transport {
            Transport::Process(spec) => {
                Endpoint::Process(Supervisor::new(&definition.name, spec.clone(), &self.settings))
            }
            Transport::Remote(spec) => Endpoint::Remote(Arc::new(RemoteClient::new(
                &definition.name,
                spec,
                self.http.clone(),
                &self.settings.bridge,
            )?)),
        })
    }

    pub fn configurations(&self) -> Vec<ConfigurationSource> {
        self.snapshot().sources.clone()
    }

    pub fn warnings(&self) -> Vec<ConfigWarning> {
        self.snapshot().warnings.clone()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    // ─── Queries ─────────────────────────────────────────────

    /// Every configured server. Never waits on a process.
    pub fn list_servers(&self) -> Vec<ServerHandle> {
        let snapshot = self.snapshot();
        let health = read(&self.health);
        snapshot
            .routes
            .iter()
            .map(|(name, route)| build_handle(name, route, health.get(name)))
            .collect()
    }

    pub fn server(&self, name: &str) -> Result<ServerDetail> {
        let route = self.route(name)?;
        let handle = build_handle(name, &route, read(&self.health).get(name));
        Ok(ServerDetail {
            handle,
            definition: route.resolved.definition.clone(),
        })
    }

    pub fn server_config(&self, name: &str) -> Result<ServerDefinition> {
        Ok(self.route(name)?.resolved.definition.clone())
    }

    /// Recent stderr and lifecycle lines. Remote servers have none.
    pub fn diagnostics(&self, name: &str, count: usize) -> Result<Vec<LogLine>> {
        Ok(match &self.route(name)?.endpoint {
            Endpoint::Process(supervisor) => supervisor.recent_diagnostics(count),
            Endpoint::Remote(_) => Vec::new(),
        })
    }

    // ─── Invocation ──────────────────────────────────────────

    /// Call tool `operation` on server `name` with `payload` as its arguments.
    pub async fn invoke(
        &self,
        name: &str,
        operation: &str,
        payload: Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let params = json!({ "name": operation, "arguments": payload });
        self.request(name, "tools/call", Some(params), deadline).await
    }

    /// Raw JSON-RPC pass-through.
    pub async fn request(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let route = self.route(name)?;
        tracing::debug!("Routing {} to '{}'", method, name);
        route.endpoint.call(method, params, deadline).await
    }

    pub async fn notify(&self, name: &str, method: &str, params: Option<Value>) -> Result<()> {
        self.route(name)?.endpoint.notify(method, params).await
    }

    // ─── Health & control ────────────────────────────────────

    /// Probe every server concurrently. The result always names every
    /// configured server; a failed or panicked probe counts as unhealthy.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let snapshot = self.snapshot();
        let timeout = self.settings.supervisor.health_timeout();

        let mut probes = JoinSet::new();
        for (name, route) in &snapshot.routes {
            let name = name.clone();
            let route = route.clone();
            probes.spawn(async move {
                let outcome = route.endpoint.probe(timeout).await;
                (name, route, outcome)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((name, route, outcome)) => {
                    results.insert(name.clone(), outcome.is_ok());
                    self.record_health(&name, &route, outcome);
                }
                Err(e) => tracing::error!("Health probe task failed: {}", e),
            }
        }
        for name in snapshot.routes.keys() {
            results.entry(name.clone()).or_insert(false);
        }

        let healthy = results.values().filter(|ok| **ok).count();
        tracing::debug!("Health check: {}/{} healthy", healthy, results.len());
        results
    }

    /// Re-run capability discovery for one server.
    pub async fn refresh_capabilities(&self, name: &str) -> Result<Vec<String>> {
        let route = self.route(name)?;
        let timeout = self.settings.supervisor.health_timeout();
        let outcome = route.endpoint.refresh(timeout).await;
        let tools = outcome.as_ref().ok().cloned();
        self.record_health(name, &route, outcome.clone().map(|_| tools));
        outcome
    }

    /// Stop and start a server, resetting its restart budget.
    pub async fn restart(&self, name: &str) -> Result<ServerHandle> {
        let route = self.route(name)?;
        let outcome = match &route.endpoint {
            Endpoint::Process(supervisor) => supervisor
                .restart()
                .await
                .map(|_| supervisor.status().introspection.map(|i| i.tools)),
            Endpoint::Remote(client) => client
                .introspect(self.settings.supervisor.health_timeout())
                .await
                .map(|i| Some(i.tools)),
        };
        self.record_health(name, &route, outcome.clone());
        outcome?;
        self.server(name).map(|detail| detail.handle)
    }

    /// Start a server ahead of its first invocation.
    pub async fn warm_up(&self, name: &str) -> Result<ServerHandle> {
        let route = self.route(name)?;
        let outcome = route.endpoint.probe(self.settings.supervisor.health_timeout()).await;
        self.record_health(name, &route, outcome.clone());
        outcome?;
        self.server(name).map(|detail| detail.handle)
    }

    /// Stop every supervised process. Configured servers stay listed but
    /// refuse new work.
    pub async fn shutdown(&self) {
        let _guard = self.reload_lock.lock().await;
        let snapshot = self.snapshot();
        tracing::info!("Stopping {} server(s)", snapshot.routes.len());
        retire_all(snapshot.routes.values().map(|r| r.endpoint.clone()).collect()).await;
    }

    // ─── Internals ───────────────────────────────────────────

    fn snapshot(&self) -> Arc<Directory> {
        read(&self.directory).clone()
    }

    fn route(&self, name: &str) -> Result<Arc<Route>> {
        self.snapshot()
            .routes
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))
    }

    /// Store a probe result unless the server was replaced in the meantime.
    fn record_health(&self, name: &str, route: &Arc<Route>, outcome: Result<Option<Vec<String>>>) {
        let current = self.snapshot();
        let still_current = current
            .routes
            .get(name)
            .is_some_and(|r| r.endpoint.same_as(&route.endpoint));
        if !still_current {
            return;
        }

        let mut health = write(&self.health);
        let record = health.entry(name.to_string()).or_default();
        record.checked_at = Some(current_timestamp());
        match outcome {
            Ok(tools) => {
                record.liveness = Liveness::Healthy;
                record.last_error = None;
                if let Some(tools) = tools {
                    record.capabilities = Some(tools);
                }
            }
            Err(e) => {
                tracing::debug!("'{}' is unhealthy: {}", name, e);
                record.liveness = Liveness::Unhealthy;
                record.last_error = Some(e.to_string());
            }
        }
    }
}

fn build_handle(name: &str, route: &Route, record: Option<&HealthRecord>) -> ServerHandle {
    let record = record.cloned().unwrap_or_default();
    let resolved = &route.resolved;
    let mut handle = ServerHandle {
        name: name.to_string(),
        transport: resolved.definition.kind(),
        liveness: record.liveness,
        state: None,
        state_since: None,
        available: true,
        capabilities: record.capabilities.clone().unwrap_or_default(),
        restart_count: 0,
        pid: None,
        last_health_check: record.checked_at,
        last_error: record.last_error.clone(),
        scope: resolved.scope,
        origin: resolved.origin.clone(),
    };

    match &route.endpoint {
        Endpoint::Process(supervisor) => {
            let status = supervisor.status();
            handle.state = Some(status.state());
            handle.state_since = Some(status.state_since());
            handle.available = supervisor.is_available();
            handle.restart_count = status.restart_count;
            handle.pid = status.pid;
            if status.last_error.is_some() {
                handle.last_error = status.last_error.clone();
            }
            if record.capabilities.is_none() {
                if let Some(introspection) = status.introspection {
                    handle.capabilities = introspection.tools;
                }
            }
        }
        Endpoint::Remote(client) => {
            if record.capabilities.is_none() {
                if let Some(introspection) = client.introspection() {
                    handle.capabilities = introspection.tools;
                }
            }
        }
    }
    handle
}

async fn retire_all(endpoints: Vec<Endpoint>) {
    let mut set = JoinSet::new();
    for endpoint in endpoints {
        set.spawn(async move { endpoint.retire().await });
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Failed to stop a server: {}", e);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
