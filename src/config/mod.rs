//! Daemon settings (`config/bridge.toml`) and the MCP server configuration feed.

pub mod definition;
pub mod loader;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use definition::{
    ConfigError, ProcessSpec, RemoteSpec, Scope, ServerDefinition, Transport, TransportKind,
};
pub use loader::{
    CandidatePath, ConfigLoader, ConfigWarning, ConfigurationSource, LoadedConfig, ParsedSource,
    ResolvedDefinition, ScopeRoots,
};

pub const DEFAULT_SETTINGS_PATH: &str = "config/bridge.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:57480";

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: String,
    pub scopes: ScopeSettings,
    pub supervisor: SupervisorSettings,
    pub bridge: BridgeSettings,
}

/// Where agent configuration files are looked up.
///
/// `global_root` is the configuration directory itself (default
/// `~/.aws/amazonq`); `project_root` is a project directory whose `.amazonq`
/// subdirectory is scanned (default: the working directory).
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ScopeSettings {
    pub global_root: Option<PathBuf>,
    pub project_root: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorSettings {
    pub startup_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub health_failure_threshold: u32,
    /// Restart attempts allowed over a supervisor's lifetime.
    pub max_restarts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub grace_period_ms: u64,
    pub log_buffer_size: usize,
    /// Start process servers right after they are loaded instead of on first use.
    pub eager_start: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct BridgeSettings {
    pub default_timeout_ms: u64,
    pub max_in_flight: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            scopes: ScopeSettings::default(),
            supervisor: SupervisorSettings::default(),
            bridge: BridgeSettings::default(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            health_interval_ms: 30_000,
            health_timeout_ms: 5_000,
            health_failure_threshold: 3,
            max_restarts: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 10_000,
            grace_period_ms: 2_000,
            log_buffer_size: 1_000,
            eager_start: false,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_in_flight: 64,
        }
    }
}

impl Settings {
    /// Load settings from `MCP_BRIDGE_CONFIG` or `config/bridge.toml`,
    /// then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("MCP_BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let mut settings = Self::load_from(&path)?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Missing file yields defaults; a malformed one is logged and ignored.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read {}: {}", path.display(), e)),
        };
        match toml::from_str(&s) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("MCP_BRIDGE_LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(root) = var("MCP_BRIDGE_GLOBAL_ROOT") {
            self.scopes.global_root = Some(PathBuf::from(root));
        }
        if let Some(root) = var("MCP_BRIDGE_PROJECT_ROOT") {
            self.scopes.project_root = Some(PathBuf::from(root));
        }
    }
}

impl ScopeSettings {
    pub fn roots(&self) -> ScopeRoots {
        let global = self
            .global_root
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".aws").join("amazonq")));
        let project = self
            .project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|dir| dir.join(".amazonq"));
        ScopeRoots { global, project }
    }
}

impl SupervisorSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Delay before restart attempt `attempt` (0-based): doubles from
    /// `backoff_initial_ms`, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

impl BridgeSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
