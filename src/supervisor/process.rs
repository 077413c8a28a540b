//! One running server process: its bridge, its stderr drain and its waiter.
//!
//! - stdout/stdin belong to the [`Bridge`]
//! - stderr is drained into a shared [`LogBuffer`] and re-emitted through `tracing`
//! - the child itself is owned by a waiter task that reports the exit status

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ProcessSpec;
use crate::error::BridgeError;
use crate::protocol::bridge::{Bridge, BridgeLimits};
use crate::utils::{current_timestamp, lock};

/// Matches the usual level keywords anywhere in a stderr line.
const LEVEL_PATTERN: &str = r"(?i)\b(?P<level>TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL|CRITICAL)\b";

/// How long termination waits for the stderr drain to finish.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Log Types ───────────────────────────────────────────────

/// A single diagnostic line from a server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stderr,
    /// Lifecycle messages from the supervisor itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size,
        }
    }

    /// Push a new log line and return the created `LogLine`.
    pub fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// Get the most recent `count` lines, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub type SharedLogBuffer = Arc<Mutex<LogBuffer>>;

// ─── Process Instance ────────────────────────────────────────

/// A live child process speaking JSON-RPC on stdio.
pub struct ProcessInstance {
    server: String,
    pid: u32,
    bridge: Arc<Bridge>,
    diagnostics: SharedLogBuffer,
    exit_rx: watch::Receiver<Option<String>>,
    kill_tx: Option<oneshot::Sender<()>>,
    stderr_task: JoinHandle<()>,
}

impl ProcessInstance {
    /// Launch `spec` with piped stdio and wrap it in a bridge.
    pub fn spawn(
        server: &str,
        spec: &ProcessSpec,
        limits: BridgeLimits,
        diagnostics: SharedLogBuffer,
    ) -> Result<Self, BridgeError> {
        let startup = |reason: String| BridgeError::Startup {
            server: server.to_string(),
            reason,
        };

        let mut cmd = TokioCommand::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| startup(format!("failed to spawn '{}': {}", spec.command, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| startup("failed to get PID of spawned process".to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(startup("stdio pipes were not captured".to_string()));
        };

        let bridge = Bridge::spawn(server, stdout, stdin, limits);

        // ── stderr reader ────────────────────────────────────
        let stderr_task = tokio::spawn(drain_stderr(server.to_string(), stderr, diagnostics.clone()));

        // ── process waiter ───────────────────────────────────
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        {
            let server = server.to_string();
            let buf = diagnostics.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    // Explicit kill request, or the instance was dropped.
                    _ = kill_rx => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Failed to kill '{}' (pid {}): {}", server, pid, e);
                        }
                        child.wait().await
                    }
                };
                let exit_msg = match status {
                    Ok(status) => format!("Process exited with {}", status),
                    Err(e) => format!("Failed to wait for process: {}", e),
                };
                tracing::info!("'{}' (pid {}): {}", server, pid, exit_msg);
                lock(&buf).push(LogSource::System, exit_msg.clone(), LogLevel::Info);
                let _ = exit_tx.send(Some(exit_msg));
            });
        }

        let msg = format!("Process started with PID {}", pid);
        tracing::info!("'{}': {}", server, msg);
        lock(&diagnostics).push(LogSource::System, msg, LogLevel::Info);

        Ok(Self {
            server: server.to_string(),
            pid,
            bridge,
            diagnostics,
            exit_rx,
            kill_tx: Some(kill_tx),
            stderr_task,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn bridge(&self) -> Arc<Bridge> {
        self.bridge.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the process exits and return its exit description.
    pub async fn wait_exit(&mut self) -> String {
        loop {
            if let Some(msg) = self.exit_rx.borrow_and_update().clone() {
                return msg;
            }
            if self.exit_rx.changed().await.is_err() {
                return "process waiter stopped".to_string();
            }
        }
    }

    /// Close the bridge, ask the process to stop, and force-kill it after
    /// `grace` if it is still alive.
    pub async fn terminate(mut self, grace: Duration, reason: &str) {
        self.bridge.shutdown(reason);

        if !self.has_exited() {
            send_terminate(self.pid);
            if tokio::time::timeout(grace, self.wait_exit()).await.is_err() {
                tracing::warn!(
                    "'{}' (pid {}) did not exit within {:?}, killing",
                    self.server,
                    self.pid,
                    grace
                );
                lock(&self.diagnostics).push(
                    LogSource::System,
                    format!("Force-killing after {:?} grace period", grace),
                    LogLevel::Warn,
                );
                if let Some(kill) = self.kill_tx.take() {
                    let _ = kill.send(());
                }
                let _ = tokio::time::timeout(grace.max(Duration::from_secs(1)), self.wait_exit()).await;
            }
        }

        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut self.stderr_task).await.is_err() {
            self.stderr_task.abort();
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {
    // Closing stdin is the only graceful signal available here.
}

async fn drain_stderr<R>(server: String, stderr: R, buf: SharedLogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        let level = parse_log_level(&line, level_regex());
        match level {
            LogLevel::Error => tracing::error!(target: "mcp_bridge::stderr", "[{}] {}", server, line),
            LogLevel::Warn => tracing::warn!(target: "mcp_bridge::stderr", "[{}] {}", server, line),
            LogLevel::Info => tracing::info!(target: "mcp_bridge::stderr", "[{}] {}", server, line),
            LogLevel::Debug => tracing::debug!(target: "mcp_bridge::stderr", "[{}] {}", server, line),
        }
        lock(&buf).push(LogSource::Stderr, line, level);
    }
}

// ─── Helpers ─────────────────────────────────────────────────

fn level_regex() -> Option<&'static Regex> {
    static LEVEL_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    LEVEL_REGEX
        .get_or_init(|| Regex::new(LEVEL_PATTERN).ok())
        .as_ref()
}

/// Parse the log level from a stderr line.
///
/// The pattern must contain a named capture group `level`. Lines without a
/// recognisable level are Info.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(line) {
            if let Some(level_match) = caps.name("level") {
                return match level_match.as_str().to_uppercase().as_str() {
                    "ERROR" | "FATAL" | "CRITICAL" => LogLevel::Error,
                    "WARN" | "WARNING" => LogLevel::Warn,
                    "DEBUG" | "TRACE" => LogLevel::Debug,
                    _ => LogLevel::Info,
                };
            }
        }
    }
    LogLevel::Info
}
