//! Error types for configuration loading and validation.

use std::path::PathBuf;

/// Errors raised while loading engine settings or domain documents.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in {source_name}: {reason}")]
    Validation { source_name: String, reason: String },

    #[error("Domains directory not found: {0}")]
    MissingDirectory(PathBuf),
}

impl ConfigError {
    pub(crate) fn validation(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
