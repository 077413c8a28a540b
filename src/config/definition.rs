//! Server definitions as declared under `mcpServers` in agent configuration files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why a configuration file (or one definition inside it) was rejected.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}: 'mcpServers' must be an object")]
    InvalidLayout(PathBuf),

    #[error("server definition with an empty name")]
    MissingName,

    #[error("server '{0}' declares neither a transport, a command nor a url")]
    MissingTransport(String),

    #[error("server '{server}' has unknown transport '{transport}'")]
    UnknownTransport { server: String, transport: String },

    #[error("server '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("server '{0}' has no url")]
    MissingUrl(String),

    #[error("server '{server}' has an invalid url '{url}': {reason}")]
    InvalidUrl {
        server: String,
        url: String,
        reason: String,
    },

    #[error("server '{server}' has an invalid header '{header}'")]
    InvalidHeader { server: String, header: String },

    #[error("server '{server}' is malformed: {reason}")]
    Malformed { server: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    Remote,
}

/// A named server and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerDefinition {
    pub name: String,
    #[serde(flatten)]
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Transport {
    Process(ProcessSpec),
    Remote(RemoteSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSpec {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProcessSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl RemoteSpec {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl ServerDefinition {
    pub fn kind(&self) -> TransportKind {
        match self.transport {
            Transport::Process(_) => TransportKind::Process,
            Transport::Remote(_) => TransportKind::Remote,
        }
    }

    /// Build a definition from one `mcpServers` entry.
    pub fn from_entry(name: &str, entry: &Value) -> Result<Self, ConfigError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::MissingName);
        }

        let raw = RawServerEntry::deserialize(entry).map_err(|e| ConfigError::Malformed {
            server: name.to_string(),
            reason: e.to_string(),
        })?;

        let transport = match raw.kind(name)? {
            TransportKind::Process => {
                let command = raw.command.as_deref().map(str::trim).unwrap_or_default();
                if command.is_empty() {
                    return Err(ConfigError::EmptyCommand(name.to_string()));
                }
                Transport::Process(ProcessSpec {
                    command: command.to_string(),
                    args: raw.args,
                    env: raw.env,
                    working_directory: raw.working_directory,
                    timeout_ms: raw.timeout_ms,
                })
            }
            TransportKind::Remote => {
                let url = raw.url.as_deref().map(str::trim).unwrap_or_default();
                if url.is_empty() {
                    return Err(ConfigError::MissingUrl(name.to_string()));
                }
                validate_url(name, url)?;
                validate_headers(name, &raw.headers)?;
                Transport::Remote(RemoteSpec {
                    url: url.to_string(),
                    headers: raw.headers,
                    timeout_ms: raw.timeout_ms,
                })
            }
        };

        Ok(Self {
            name: name.to_string(),
            transport,
        })
    }
}

/// The on-disk shape of a server entry. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerEntry {
    transport: Option<String>,
    #[serde(rename = "type")]
    legacy_type: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(alias = "cwd")]
    working_directory: Option<PathBuf>,
    #[serde(alias = "timeout")]
    timeout_ms: Option<u64>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

impl RawServerEntry {
    fn kind(&self, name: &str) -> Result<TransportKind, ConfigError> {
        if let Some(transport) = &self.transport {
            return parse_kind(name, transport);
        }
        if let Some(legacy) = &self.legacy_type {
            return parse_kind(name, legacy);
        }
        if self.command.is_some() {
            Ok(TransportKind::Process)
        } else if self.url.is_some() {
            Ok(TransportKind::Remote)
        } else {
            Err(ConfigError::MissingTransport(name.to_string()))
        }
    }
}

fn parse_kind(name: &str, value: &str) -> Result<TransportKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "process" | "stdio" => Ok(TransportKind::Process),
        "remote" | "http" | "streamable-http" | "sse" => Ok(TransportKind::Remote),
        other => Err(ConfigError::UnknownTransport {
            server: name.to_string(),
            transport: other.to_string(),
        }),
    }
}

fn validate_url(name: &str, url: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        server: name.to_string(),
        url: url.to_string(),
        reason,
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(invalid(format!("unsupported scheme '{scheme}'"))),
    }
}

fn validate_headers(name: &str, headers: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    for (key, value) in headers {
        if HeaderName::from_bytes(key.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            return Err(ConfigError::InvalidHeader {
                server: name.to_string(),
                header: key.clone(),
            });
        }
    }
    Ok(())
}
