//! Process supervision for stdio MCP servers.
//!
//! Each [`Supervisor`] owns at most one running process at a time. Its
//! lifecycle runs in a dedicated task: handshake, periodic health pings, and
//! restart with exponential backoff after a failure. Callers never touch the
//! process directly; they ask for a ready [`Bridge`] through
//! [`Supervisor::ensure_ready`], which starts the server lazily.

pub mod process;
pub mod state_machine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ProcessSpec, Settings, SupervisorSettings};
use crate::error::{BridgeError, Result};
use crate::protocol::bridge::{Bridge, BridgeLimits};
use crate::protocol::{introspect, tool_names, Introspection};
use crate::utils::{current_timestamp, lock};
use process::{LogBuffer, LogLevel, LogLine, LogSource, ProcessInstance, SharedLogBuffer};
pub use state_machine::{State, StateMachine, TransitionError};

/// Point-in-time view of a supervised server.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    machine: StateMachine,
    /// False once startup failed or the restart budget ran out.
    pub available: bool,
    pub restart_count: u32,
    pub pid: Option<u32>,
    /// Unix seconds of the last successful handshake or ping.
    pub last_health_ok: Option<u64>,
    pub last_error: Option<String>,
    pub introspection: Option<Introspection>,
}

impl SupervisorStatus {
    fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            available: true,
            restart_count: 0,
            pid: None,
            last_health_ok: None,
            last_error: None,
            introspection: None,
        }
    }

    pub fn state(&self) -> State {
        self.machine.state
    }

    /// Unix seconds when the current state was entered.
    pub fn state_since(&self) -> u64 {
        self.machine.entered_at
    }
}

struct Lifecycle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

enum RestartOutcome {
    Restarted(ProcessInstance),
    Exhausted(String),
    Cancelled,
}

pub struct Supervisor {
    name: String,
    spec: ProcessSpec,
    settings: SupervisorSettings,
    limits: BridgeLimits,
    status: watch::Sender<SupervisorStatus>,
    bridge: Mutex<Option<Arc<Bridge>>>,
    diagnostics: SharedLogBuffer,
    lifecycle: Mutex<Option<Lifecycle>>,
    /// Serializes explicit restart/stop/dispose.
    control: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl Supervisor {
    pub fn new(name: &str, spec: ProcessSpec, settings: &Settings) -> Arc<Self> {
        let limits = BridgeLimits::new(&settings.bridge, spec.timeout());
        let (status, _) = watch::channel(SupervisorStatus::new());
        Arc::new(Self {
            name: name.to_string(),
            spec,
            settings: settings.supervisor.clone(),
            limits,
            status,
            bridge: Mutex::new(None),
            diagnostics: Arc::new(Mutex::new(LogBuffer::with_capacity(settings.supervisor.log_buffer_size))),
            lifecycle: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Non-blocking read of the current lifecycle state.
    pub fn state(&self) -> State {
        self.status.borrow().state()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.status.borrow().available
    }

    pub fn pid(&self) -> Option<u32> {
        self.status.borrow().pid
    }

    /// Most recent `count` diagnostic lines, oldest first.
    pub fn recent_diagnostics(&self, count: usize) -> Vec<LogLine> {
        lock(&self.diagnostics).get_recent(count)
    }

    /// Return a ready bridge, starting the process first if it has never run.
    ///
    /// Concurrent callers share one start. Callers that waited on a start
    /// which failed get `Startup`; later callers get `Unavailable`.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<Arc<Bridge>> {
        let mut rx = self.status.subscribe();
        let mut waited_on_start = false;
        let wait_bound = self.settings.startup_timeout() + self.settings.grace_period() + Duration::from_secs(1);

        loop {
            if self.claim_start() {
                waited_on_start = true;
            }

            let status = rx.borrow_and_update().clone();
            match status.state() {
                State::Ready => {
                    if let Some(bridge) = self.current_bridge() {
                        return Ok(bridge);
                    }
                }
                State::Starting => waited_on_start = true,
                State::Degraded => {
                    return Err(self.unavailable(
                        status
                            .last_error
                            .unwrap_or_else(|| "restarting after a failure".to_string()),
                    ));
                }
                State::Stopped => {
                    if self.disposed.load(Ordering::SeqCst) {
                        return Err(self.unavailable("server was removed".to_string()));
                    }
                    if !status.available {
                        let reason = status
                            .last_error
                            .unwrap_or_else(|| "server is unavailable".to_string());
                        return Err(if waited_on_start {
                            BridgeError::Startup {
                                server: self.name.clone(),
                                reason,
                            }
                        } else {
                            self.unavailable(reason)
                        });
                    }
                    // Stopped but startable: claim it on the next pass.
                    continue;
                }
            }

            match tokio::time::timeout(wait_bound, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(self.unavailable("supervisor is gone".to_string())),
                Err(_) => {
                    return Err(BridgeError::Startup {
                        server: self.name.clone(),
                        reason: format!("not ready after {:?}", wait_bound),
                    })
                }
            }
        }
    }

    /// Call `method`, starting the process first if needed.
    ///
    /// The deadline (the caller's, else the bridge default) covers the start
    /// as well as the call; a slow start ends in `Timeout`.
    pub async fn call(self: &Arc<Self>, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        let budget = timeout.unwrap_or(self.limits.default_timeout);
        let timed_out = || BridgeError::Timeout {
            server: self.name.clone(),
            method: method.to_string(),
            timeout: budget,
        };

        let started = Instant::now();
        let bridge = match tokio::time::timeout(budget, self.ensure_ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                tracing::warn!("'{}' {} timed out after {:?} waiting for startup", self.name, method, budget);
                return Err(timed_out());
            }
        };

        let remaining = budget.saturating_sub(started.elapsed());
        match bridge.call(method, params, Some(remaining)).await {
            Err(BridgeError::Timeout { .. }) => Err(timed_out()),
            other => other,
        }
    }

    pub async fn warm_up(self: &Arc<Self>) -> Result<()> {
        self.ensure_ready().await.map(|_| ())
    }

    /// One health probe: start if needed, then ping.
    pub async fn probe(self: &Arc<Self>) -> Result<()> {
        let bridge = self.ensure_ready().await?;
        self.ping(&bridge).await
    }

    /// Re-issue `tools/list` and record the result.
    pub async fn refresh_capabilities(self: &Arc<Self>) -> Result<Vec<String>> {
        let bridge = self.ensure_ready().await?;
        let result = bridge
            .call("tools/list", None, Some(self.settings.health_timeout().max(self.limits.default_timeout)))
            .await?;
        let tools = tool_names(&result);
        self.status.send_modify(|s| {
            s.introspection.get_or_insert_with(Introspection::default).tools = tools.clone();
        });
        Ok(tools)
    }

    /// Stop the current process (if any), reset the restart budget and start again.
    pub async fn restart(self: &Arc<Self>) -> Result<Arc<Bridge>> {
        let _control = self.control.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Err(self.unavailable("server was removed".to_string()));
        }
        tracing::info!("Restarting '{}' on request", self.name);
        self.stop_lifecycle().await;
        self.status.send_if_modified(|s| {
            if s.state() != State::Stopped {
                return false;
            }
            s.available = true;
            s.restart_count = 0;
            s.last_error = None;
            true
        });
        self.ensure_ready().await
    }

    /// Make a retired server startable again and reset its restart budget.
    pub fn reset_budget(&self) {
        self.status.send_if_modified(|s| {
            let retired = s.state() == State::Stopped && !s.available;
            if retired {
                tracing::info!("'{}' is available again", self.name);
                s.available = true;
                s.last_error = None;
            }
            let changed = retired || s.restart_count != 0;
            s.restart_count = 0;
            changed
        });
    }

    /// Stop the running process. The server can be started again later.
    pub async fn stop(&self) {
        let _control = self.control.lock().await;
        self.stop_lifecycle().await;
    }

    /// Stop for good; every later call fails with `Unavailable`.
    pub async fn dispose(&self) {
        let _control = self.control.lock().await;
        self.status.send_modify(|s| {
            self.disposed.store(true, Ordering::SeqCst);
            s.available = false;
        });
        self.stop_lifecycle().await;
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Atomically move Stopped -> Starting and launch the lifecycle task.
    fn claim_start(self: &Arc<Self>) -> bool {
        self.status.send_if_modified(|s| {
            if self.disposed.load(Ordering::SeqCst) || s.state() != State::Stopped || !s.available {
                return false;
            }
            if let Err(e) = s.machine.transition(State::Starting) {
                tracing::warn!("'{}': {}", self.name, e);
                return false;
            }
            s.last_error = None;
            s.pid = None;

            let token = CancellationToken::new();
            let task = tokio::spawn(Arc::clone(self).run(token.clone()));
            *lock(&self.lifecycle) = Some(Lifecycle { token, task });
            true
        })
    }

    async fn stop_lifecycle(&self) {
        let lifecycle = lock(&self.lifecycle).take();
        if let Some(lifecycle) = lifecycle {
            lifecycle.token.cancel();
            if let Err(e) = lifecycle.task.await {
                tracing::error!("Lifecycle task for '{}' failed: {}", self.name, e);
            }
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut instance = match self.start_instance(&token).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!("{}", e);
                let reason = startup_reason(e);
                self.update(State::Stopped, |s| {
                    s.available = false;
                    s.last_error = Some(reason);
                });
                return;
            }
        };

        loop {
            let failure = tokio::select! {
                _ = token.cancelled() => None,
                reason = self.monitor(&mut instance) => Some(reason),
            };

            let Some(reason) = failure else {
                self.clear_bridge();
                instance.terminate(self.settings.grace_period(), "server stopped").await;
                self.update(State::Stopped, |s| s.pid = None);
                return;
            };

            tracing::warn!("'{}' degraded: {}", self.name, reason);
            lock(&self.diagnostics).push(LogSource::System, format!("Degraded: {}", reason), LogLevel::Warn);
            self.clear_bridge();
            self.update(State::Degraded, |s| s.last_error = Some(reason.clone()));
            instance.terminate(self.settings.grace_period(), &reason).await;

            match self.restart_with_backoff(&token).await {
                RestartOutcome::Restarted(next) => instance = next,
                RestartOutcome::Exhausted(reason) => {
                    tracing::error!("'{}' is unavailable: {}", self.name, reason);
                    self.update(State::Stopped, |s| {
                        s.available = false;
                        s.pid = None;
                        s.last_error = Some(reason);
                    });
                    return;
                }
                RestartOutcome::Cancelled => {
                    self.update(State::Stopped, |s| s.pid = None);
                    return;
                }
            }
        }
    }

    /// Spawn the process and run the handshake. On success the state is Ready.
    async fn start_instance(&self, token: &CancellationToken) -> Result<ProcessInstance> {
        tracing::info!("Starting '{}': {} {:?}", self.name, self.spec.command, self.spec.args);
        let instance = ProcessInstance::spawn(&self.name, &self.spec, self.limits, self.diagnostics.clone())?;
        let bridge = instance.bridge();
        let startup_timeout = self.settings.startup_timeout();

        let handshake = tokio::time::timeout(startup_timeout, introspect(&self.name, bridge.as_ref(), startup_timeout));
        let outcome = tokio::select! {
            _ = token.cancelled() => Err("cancelled during startup".to_string()),
            result = handshake => match result {
                Ok(Ok(introspection)) => Ok(introspection),
                Ok(Err(e)) => Err(format!("handshake failed: {}", e)),
                Err(_) => Err(format!("no initialize reply within {:?}", startup_timeout)),
            },
        };

        match outcome {
            Ok(introspection) => {
                let pid = instance.pid();
                tracing::info!(
                    "'{}' ready (pid {}, {} tool(s))",
                    self.name,
                    pid,
                    introspection.tools.len()
                );
                *lock(&self.bridge) = Some(bridge);
                self.update(State::Ready, |s| {
                    s.pid = Some(pid);
                    s.last_error = None;
                    s.last_health_ok = Some(current_timestamp());
                    s.introspection = Some(introspection);
                });
                Ok(instance)
            }
            Err(reason) => {
                lock(&self.diagnostics).push(LogSource::System, format!("Startup failed: {}", reason), LogLevel::Error);
                instance.terminate(self.settings.grace_period(), &reason).await;
                Err(BridgeError::Startup {
                    server: self.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Watch a Ready process until it fails; returns the failure reason.
    async fn monitor(&self, instance: &mut ProcessInstance) -> String {
        let bridge = instance.bridge();
        let interval = self.settings.health_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let threshold = self.settings.health_failure_threshold.max(1);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                exit = instance.wait_exit() => return format!("process exited unexpectedly ({})", exit),
                _ = bridge.closed() => {
                    return bridge.close_reason().unwrap_or_else(|| "bridge closed".to_string());
                }
                _ = ticker.tick() => match self.ping(&bridge).await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        tracing::warn!("Health check {}/{} for '{}' failed: {}", failures, threshold, self.name, e);
                        lock(&self.diagnostics).push(
                            LogSource::System,
                            format!("Health check {}/{} failed: {}", failures, threshold, e),
                            LogLevel::Warn,
                        );
                        if failures >= threshold {
                            return format!("{} consecutive health checks failed (last: {})", failures, e);
                        }
                    }
                },
            }
        }
    }

    async fn restart_with_backoff(&self, token: &CancellationToken) -> RestartOutcome {
        loop {
            let attempt = self.status.borrow().restart_count;
            let max = self.settings.max_restarts;
            if attempt >= max {
                return RestartOutcome::Exhausted(format!("restart budget of {} exhausted", max));
            }
            let delay = self.settings.backoff(attempt);
            self.status.send_modify(|s| s.restart_count += 1);

            let msg = format!("Restarting in {:?} (attempt {}/{})", delay, attempt + 1, max);
            tracing::info!("'{}': {}", self.name, msg);
            lock(&self.diagnostics).push(LogSource::System, msg, LogLevel::Warn);

            tokio::select! {
                _ = token.cancelled() => return RestartOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.start_instance(token).await {
                Ok(instance) => return RestartOutcome::Restarted(instance),
                Err(_) if token.is_cancelled() => return RestartOutcome::Cancelled,
                Err(e) => {
                    tracing::warn!("{}", e);
                    let reason = startup_reason(e);
                    self.status.send_modify(|s| s.last_error = Some(reason));
                }
            }
        }
    }

    /// Any JSON-RPC reply, error included, proves the process is alive.
    async fn ping(&self, bridge: &Bridge) -> Result<()> {
        match bridge.call("ping", None, Some(self.settings.health_timeout())).await {
            Ok(_) | Err(BridgeError::Rpc { .. }) => {
                self.status.send_modify(|s| s.last_health_ok = Some(current_timestamp()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn update(&self, to: State, apply: impl FnOnce(&mut SupervisorStatus)) {
        self.status.send_modify(|s| {
            if s.state() != to {
                if let Err(e) = s.machine.transition(to) {
                    tracing::warn!("'{}': {}", self.name, e);
                }
            }
            apply(s);
        });
    }

    fn current_bridge(&self) -> Option<Arc<Bridge>> {
        lock(&self.bridge).clone()
    }

    fn clear_bridge(&self) {
        lock(&self.bridge).take();
    }

    fn unavailable(&self, reason: String) -> BridgeError {
        BridgeError::Unavailable {
            server: self.name.clone(),
            reason,
        }
    }
}

fn startup_reason(error: BridgeError) -> String {
    match error {
        BridgeError::Startup { reason, .. } => reason,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.supervisor.startup_timeout_ms = 300;
        settings.supervisor.grace_period_ms = 200;
        settings.supervisor.backoff_initial_ms = 10;
        settings.supervisor.backoff_max_ms = 20;
        settings
    }

    fn spec(command: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Default::default(),
            working_directory: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_new_supervisor_is_stopped_and_available() {
        let sup = Supervisor::new("idle", spec("does-not-matter", &[]), &fast_settings());
        assert_eq!(sup.state(), State::Stopped);
        assert!(sup.is_available());
        assert_eq!(sup.pid(), None);
        assert!(sup.recent_diagnostics(10).is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable_fails_startup_and_retires() {
        let sup = Supervisor::new("ghost", spec("/definitely/not/a/binary", &[]), &fast_settings());

        let err = sup.ensure_ready().await.unwrap_err();
        assert!(matches!(err, BridgeError::Startup { .. }), "got {err:?}");
        assert_eq!(sup.state(), State::Stopped);
        assert!(!sup.is_available());

        // Later callers are told the server is unavailable, without a new spawn.
        let err = sup.ensure_ready().await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }), "got {err:?}");

        // A reload-style reset makes it startable again.
        sup.reset_budget();
        assert!(sup.is_available());
        assert!(matches!(sup.ensure_ready().await, Err(BridgeError::Startup { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_hits_startup_timeout() {
        let sup = Supervisor::new("mute", spec("sleep", &["30"]), &fast_settings());
        let started = std::time::Instant::now();

        let (a, b) = tokio::join!(sup.ensure_ready(), sup.ensure_ready());
        assert!(matches!(a, Err(BridgeError::Startup { .. })));
        assert!(matches!(b, Err(BridgeError::Startup { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.state(), State::Stopped);

        let diagnostics = sup.recent_diagnostics(50);
        assert!(diagnostics.iter().any(|l| l.content.starts_with("Startup failed")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_immediately_fails_startup() {
        let sup = Supervisor::new("quitter", spec("sh", &["-c", "echo bye >&2; exit 3"]), &fast_settings());
        let err = sup.ensure_ready().await.unwrap_err();
        assert!(matches!(err, BridgeError::Startup { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_call_deadline_covers_a_slow_start() {
        let mut settings = fast_settings();
        settings.supervisor.startup_timeout_ms = 3_000;
        let sup = Supervisor::new("slow", spec("sleep", &["30"]), &settings);
        let started = std::time::Instant::now();

        let err = sup.call("tools/list", None, Some(Duration::from_millis(200))).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Timeout { timeout, .. } if timeout == Duration::from_millis(200)),
            "got {err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        // The start itself keeps going for later callers.
        assert_eq!(sup.state(), State::Starting);
        sup.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_refuses_new_work() {
        let sup = Supervisor::new("gone", spec("does-not-matter", &[]), &fast_settings());
        sup.dispose().await;
        assert!(!sup.is_available());
        let err = sup.ensure_ready().await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
        assert!(matches!(sup.restart().await, Err(BridgeError::Unavailable { .. })));
    }
}
