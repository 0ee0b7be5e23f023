//! Session manager tunables.
//!
//! Loaded from YAML when embedded in a daemon, or built in code. Every field
//! has a default, so an empty document is a valid configuration:
//!
//! ```yaml
//! session:
//!   session_timeout_ms: 120000
//!   session_search_after_ms: 20000
//!   max_buffered_messages: 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default keep-alive window before a session is torn down.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 120_000;

/// Default interval between re-searches for a maintained session.
pub const DEFAULT_SEARCH_AFTER_MS: u64 = 20_000;

/// Default capacity of the awaiting-route buffer.
pub const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 30;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
}

/// Session manager tunables (`session.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remove a session after this long without an authenticated
    /// incoming packet (`session.timeout_ms`).
    #[serde(default = "default_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Re-trigger a route search for maintained sessions at this interval
    /// (`session.search_after_ms`).
    #[serde(default = "default_search_after_ms")]
    pub session_search_after_ms: u64,

    /// How many outbound messages may wait for route resolution at once
    /// (`session.max_buffered_messages`).
    #[serde(default = "default_max_buffered")]
    pub max_buffered_messages: usize,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MS
}

fn default_search_after_ms() -> u64 {
    DEFAULT_SEARCH_AFTER_MS
}

fn default_max_buffered() -> usize {
    DEFAULT_MAX_BUFFERED_MESSAGES
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            session_search_after_ms: DEFAULT_SEARCH_AFTER_MS,
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
        }
    }
}

/// Wrapper matching the `session:` document section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    session: Option<SessionConfig>,
}

impl SessionConfig {
    /// Parse from a YAML document (the `session:` section).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let doc: ConfigDocument = serde_yaml::from_str(yaml)?;
        Ok(doc.session.unwrap_or_default())
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }
}
