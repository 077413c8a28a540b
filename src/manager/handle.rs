//! Router-facing views of configured servers.

use std::path::PathBuf;

use serde::Serialize;

use crate::config::{ConfigWarning, Scope, ServerDefinition, TransportKind};
use crate::supervisor::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Result of the last probe of one server, written only by the manager.
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    pub liveness: Liveness,
    pub checked_at: Option<u64>,
    pub capabilities: Option<Vec<String>>,
    pub last_error: Option<String>,
}

/// Snapshot of one server as seen by callers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHandle {
    pub name: String,
    pub transport: TransportKind,
    pub liveness: Liveness,
    /// Lifecycle state; process servers only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_since: Option<u64>,
    pub available: bool,
    pub capabilities: Vec<String>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub scope: Scope,
    pub origin: PathBuf,
}

/// A handle plus the definition it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetail {
    #[serde(flatten)]
    pub handle: ServerHandle,
    pub definition: ServerDefinition,
}

/// What a load or reload changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadSummary {
    pub generation: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

impl ReloadSummary {
    pub fn total(&self) -> usize {
        self.added.len() + self.changed.len() + self.unchanged.len()
    }
}
