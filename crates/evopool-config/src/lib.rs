//! Configuration for the evopool engine.
//!
//! Two kinds of documents are loaded here:
//!
//! - **Engine settings** (`evopool.toml`): pool bounds, voting weights,
//!   evolution and convergence thresholds, budget limits, complexity tables.
//! - **Domain documents**: one TOML file per task domain describing the
//!   specialist template, scoring weights and seed enhancements.

pub mod domain;
pub mod error;
pub mod registry;
pub mod settings;

pub use domain::{DomainDocument, PoolBounds, ScoringWeights, SpecialistTemplate, HUMAN_CHECK};
pub use error::{ConfigError, Result};
pub use registry::{DomainRegistry, ExcludedDocument, LoadReport};
pub use settings::{
    default_config_path, BudgetSettings, CategoryLimits, ComplexitySettings, ComplexityTier,
    CostTier, EngineConfig, EvaluationMode, EvaluationSettings, EvolutionSettings,
    OverflowBehavior, PersistenceSettings, PoolSettings, VotingSettings, CONFIG_ENV_VAR,
};
