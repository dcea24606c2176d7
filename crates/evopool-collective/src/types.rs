//! Common types used across the engine.

use crate::budget::{BudgetCategory, BudgetWindow, Usd};
use chrono::{DateTime, Utc};
use evopool_config::ConfigError;

/// Unique identifier for a specialist.
pub type SpecialistId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Domain key (e.g., "code_generation", "administration").
pub type Domain = String;

/// Error types for engine operations.
///
/// Every variant except [`EngineError::CorruptStore`] is recoverable at the
/// engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(
        "No eligible specialist in domain '{domain}' (pool size {pool_size}, minimum {min_size}, eligible {eligible})"
    )]
    PoolExhausted {
        domain: Domain,
        pool_size: usize,
        min_size: usize,
        eligible: usize,
    },

    #[error("Council round inconclusive: required {required} votes, got {received}")]
    InsufficientVotes { required: usize, received: usize },

    #[error(
        "Budget exceeded for {category} ({window} window): spent {spent} of {limit}, {remaining} remaining, resets at {resets_at}"
    )]
    BudgetExceeded {
        category: BudgetCategory,
        window: BudgetWindow,
        spent: Usd,
        limit: Usd,
        remaining: Usd,
        resets_at: DateTime<Utc>,
    },

    #[error("Spawn failed for domain '{domain}': {reason}")]
    SpawnFailed { domain: Domain, reason: String },

    #[error("Invalid configuration in {source_name}: {reason}")]
    ConfigValidation { source_name: String, reason: String },

    #[error("Unknown domain: {0}")]
    UnknownDomain(Domain),

    #[error("Specialist not found: {0}")]
    SpecialistNotFound(SpecialistId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Pool for domain '{domain}' is at its maximum size ({max_size})")]
    PoolAtCapacity { domain: Domain, max_size: usize },

    #[error("Specialist {0} is already active")]
    AlreadyActive(SpecialistId),

    #[error("Persistent store is corrupted: {0}")]
    CorruptStore(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the engine can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::CorruptStore(_))
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation {
                source_name,
                reason,
            } => EngineError::ConfigValidation {
                source_name,
                reason,
            },
            ConfigError::Parse { path, source } => EngineError::ConfigValidation {
                source_name: path.display().to_string(),
                reason: source.to_string(),
            },
            ConfigError::Io { path, source } => EngineError::ConfigValidation {
                source_name: path.display().to_string(),
                reason: source.to_string(),
            },
            ConfigError::MissingDirectory(path) => EngineError::ConfigValidation {
                source_name: path.display().to_string(),
                reason: "directory not found".to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
