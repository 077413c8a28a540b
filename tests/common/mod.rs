// Shared fixtures for integration tests that drive the echo-tool binary.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_bridge::config::{ScopeRoots, Settings};
use mcp_bridge::manager::{Manager, ServerHandle};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const ECHO_TOOL: &str = env!("CARGO_BIN_EXE_echo-tool");

/// Global and project roots backed by temporary directories.
pub struct Workspace {
    pub global: TempDir,
    pub project: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            global: TempDir::new().unwrap(),
            project: TempDir::new().unwrap(),
        }
    }

    pub fn roots(&self) -> ScopeRoots {
        ScopeRoots {
            global: Some(self.global.path().to_path_buf()),
            project: Some(self.project.path().to_path_buf()),
        }
    }

    /// Write `servers` as the `mcpServers` table of `agents/<file>` in the global root.
    pub fn write_agent(&self, file: &str, servers: Value) {
        write_json(&self.global.path().join("agents").join(file), &json!({ "mcpServers": servers }));
    }

    pub fn manager(&self, settings: Settings) -> Arc<Manager> {
        Arc::new(Manager::with_roots(settings, self.roots()).unwrap())
    }
}

pub fn write_json(path: &Path, value: &Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Settings with short timeouts and no background health ticks.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.supervisor.startup_timeout_ms = 5_000;
    settings.supervisor.health_interval_ms = 60_000;
    settings.supervisor.health_timeout_ms = 2_000;
    settings.supervisor.backoff_initial_ms = 10;
    settings.supervisor.backoff_max_ms = 50;
    settings.supervisor.grace_period_ms = 500;
    settings.supervisor.max_restarts = 2;
    settings.bridge.default_timeout_ms = 5_000;
    settings
}

pub fn echo_server(args: &[&str]) -> Value {
    json!({ "command": ECHO_TOOL, "args": args })
}

pub fn handle(manager: &Manager, name: &str) -> ServerHandle {
    manager.server(name).unwrap().handle
}

/// Poll the server handle until `done` holds or five seconds pass.
pub async fn wait_for(manager: &Manager, name: &str, done: impl Fn(&ServerHandle) -> bool) -> ServerHandle {
    let started = Instant::now();
    loop {
        let current = handle(manager, name);
        if done(&current) {
            return current;
        }
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "server '{}' never reached the expected state: {:?}",
            name,
            current
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
