//! Configuration discovery and merging.
//!
//! Two scopes are scanned, global first and project last, so a project
//! definition replaces a global one with the same name. Within one scope root
//! the candidates are `mcp.json`, then `agents/*.json`, then `cli-agents/*.json`,
//! each directory in sorted order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use super::definition::{ConfigError, Scope, ServerDefinition};
use crate::utils::current_timestamp;

const LEGACY_FILE: &str = "mcp.json";
const AGENT_DIRS: [&str; 2] = ["agents", "cli-agents"];

/// Configuration root directory per scope. `None` disables the scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRoots {
    pub global: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePath {
    pub path: PathBuf,
    pub scope: Scope,
}

/// One parsed configuration file.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSource {
    pub origin: PathBuf,
    pub scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server names this file contributed.
    pub servers: Vec<String>,
    pub loaded_at: u64,
}

/// A definition together with the scope and file it won from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDefinition {
    pub definition: ServerDefinition,
    pub scope: Scope,
    pub origin: PathBuf,
}

/// A file that was skipped during load.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigWarning {
    pub path: PathBuf,
    pub message: String,
}

/// One configuration file after parsing. `rejected` holds the entries that
/// failed validation; their siblings are still usable.
#[derive(Debug)]
pub struct ParsedSource {
    pub source: ConfigurationSource,
    pub definitions: Vec<ServerDefinition>,
    pub rejected: Vec<ConfigError>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub definitions: BTreeMap<String, ResolvedDefinition>,
    pub sources: Vec<ConfigurationSource>,
    pub warnings: Vec<ConfigWarning>,
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    roots: ScopeRoots,
}

impl ConfigLoader {
    pub fn new(roots: ScopeRoots) -> Self {
        Self { roots }
    }

    pub fn discover(&self) -> Vec<CandidatePath> {
        discover(&self.roots)
    }

    /// Discover and load every candidate file.
    pub fn load_all(&self) -> LoadedConfig {
        load(&self.discover())
    }
}

/// List candidate configuration files, global scope first.
pub fn discover(roots: &ScopeRoots) -> Vec<CandidatePath> {
    let mut candidates = Vec::new();
    if let Some(root) = &roots.global {
        candidates.extend(candidates_in(root, Scope::Global));
    }
    if let Some(root) = &roots.project {
        candidates.extend(candidates_in(root, Scope::Project));
    }
    candidates
}

fn candidates_in(root: &Path, scope: Scope) -> Vec<CandidatePath> {
    let mut found = Vec::new();

    let legacy = root.join(LEGACY_FILE);
    if legacy.is_file() {
        found.push(CandidatePath { path: legacy, scope });
    }

    for dir in AGENT_DIRS {
        let dir = root.join(dir);
        if !dir.is_dir() {
            continue;
        }
        let pattern = format!("{}/*.json", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
            Err(e) => {
                tracing::warn!("Invalid glob pattern for {}: {}", dir.display(), e);
                continue;
            }
        };
        files.sort();
        found.extend(files.into_iter().map(|path| CandidatePath { path, scope }));
    }

    found
}

/// Parse every candidate and merge the results.
///
/// A file that fails to parse is skipped as a whole and recorded as a warning.
/// A single bad server entry is skipped on its own, also with a warning.
pub fn load(paths: &[CandidatePath]) -> LoadedConfig {
    let mut loaded = LoadedConfig::default();

    for candidate in paths {
        match parse_source(candidate) {
            Ok(ParsedSource {
                source,
                definitions,
                rejected,
            }) => {
                for e in rejected {
                    tracing::warn!("Skipping server in {}: {}", candidate.path.display(), e);
                    loaded.warnings.push(ConfigWarning {
                        path: candidate.path.clone(),
                        message: e.to_string(),
                    });
                }
                tracing::debug!(
                    "Loaded {} server(s) from {} ({:?})",
                    definitions.len(),
                    candidate.path.display(),
                    candidate.scope
                );
                for definition in definitions {
                    let name = definition.name.clone();
                    if let Some(previous) = loaded.definitions.get(&name) {
                        tracing::info!(
                            "Server '{}' from {} overrides the one from {}",
                            name,
                            candidate.path.display(),
                            previous.origin.display()
                        );
                    }
                    loaded.definitions.insert(
                        name,
                        ResolvedDefinition {
                            definition,
                            scope: candidate.scope,
                            origin: candidate.path.clone(),
                        },
                    );
                }
                loaded.sources.push(source);
            }
            Err(e) => {
                tracing::warn!("Skipping configuration {}: {}", candidate.path.display(), e);
                loaded.warnings.push(ConfigWarning {
                    path: candidate.path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    loaded
}

/// Read and validate one configuration file.
pub fn parse_source(candidate: &CandidatePath) -> Result<ParsedSource, ConfigError> {
    let path = &candidate.path;
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let document: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;

    let servers = match document.get("mcpServers") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ConfigError::InvalidLayout(path.clone())),
    };

    let mut definitions = Vec::new();
    let mut rejected = Vec::new();
    for (name, entry) in &servers {
        match ServerDefinition::from_entry(name, entry) {
            Ok(definition) => definitions.push(definition),
            Err(e) => rejected.push(e),
        }
    }

    let text_field = |key: &str| document.get(key).and_then(Value::as_str).map(str::to_string);
    let source = ConfigurationSource {
        origin: path.clone(),
        scope: candidate.scope,
        name: text_field("name"),
        description: text_field("description"),
        servers: definitions.iter().map(|d| d.name.clone()).collect(),
        loaded_at: current_timestamp(),
    };

    Ok(ParsedSource {
        source,
        definitions,
        rejected,
    })
}
