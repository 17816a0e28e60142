//! Engine configuration types.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default size of the stack segment used by the CLI.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Default size of the heap segment used by the CLI.
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration for an [`Engine`](crate::vm::Engine).
///
/// ```toml
/// stack_size = 65536
/// memory_size = 65536
/// max_contexts = 128
/// max_call_depth = 256
/// step_limit = 1000000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stack segment size for contexts started by the CLI.
    pub stack_size: usize,
    /// Heap segment size for contexts started by the CLI.
    pub memory_size: usize,
    /// Hard limit on `stack_size + memory_size` per context (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_arena_size: Option<usize>,
    /// Maximum number of registered contexts (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_contexts: Option<usize>,
    pub max_call_depth: usize,
    /// Instructions allowed per resume/consume call (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            memory_size: DEFAULT_MEMORY_SIZE,
            max_arena_size: None,
            max_contexts: None,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            step_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
