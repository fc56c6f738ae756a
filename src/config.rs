//! TOML configuration for the buffer pool and the admission gate.
//!
//! ```toml
//! [buffer_pool]
//! page_size = 16384
//! pages_per_instance = 4096
//! corruption_policy = "tolerate"
//!
//! [admission]
//! concurrency_limit = 16
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::GateOptions;
use crate::buffer::BufferPoolOptions;
use crate::types::BufferError;

/// Storage-engine settings. Missing sections and keys take their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Buffer pool settings.
    pub buffer_pool: BufferPoolOptions,
    /// Admission gate settings.
    pub admission: GateOptions,
}

/// Failure to load a [`StorageConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read storage config {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse storage config {}: {source}", path.display())]
    Parse {
        /// File that failed, or `<inline>` for strings.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// Parsed values the pool cannot run with.
    #[error("invalid storage config: {source}")]
    Invalid {
        /// The rejected setting.
        source: BufferError,
    },
}

impl StorageConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Checks both sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buffer_pool
            .validate()
            .and_then(|()| self.admission.validate())
            .map_err(|source| ConfigError::Invalid { source })
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}
