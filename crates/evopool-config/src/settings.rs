//! Engine-wide settings.
//!
//! Every section carries `#[serde(default)]` so a partial `evopool.toml`
//! only needs to name the values it overrides.

use crate::error::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit settings file.
pub const CONFIG_ENV_VAR: &str = "EVOPOOL_CONFIG";

/// File name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "evopool.toml";

/// Which evaluator produces the authoritative score for a completed task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Objective checks plus human rating.
    #[default]
    ScoringCommittee,
    /// Peer specialists vote.
    AiCouncil,
    /// Committee is authoritative; council runs for comparison only.
    Both,
}

impl EvaluationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationMode::ScoringCommittee => "scoring_committee",
            EvaluationMode::AiCouncil => "ai_council",
            EvaluationMode::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "scoring_committee" | "committee" => Some(Self::ScoringCommittee),
            "ai_council" | "council" => Some(Self::AiCouncil),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// What happens to a task whose cost does not fit the remaining budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowBehavior {
    /// Park the task until the exhausted window resets.
    Queue,
    /// Retry admission on cheaper cost tiers.
    Downgrade,
    /// Fail the task with `BudgetExceeded`.
    #[default]
    Reject,
}

/// Complexity classification of a task.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 5] = [
        ComplexityTier::Trivial,
        ComplexityTier::Low,
        ComplexityTier::Medium,
        ComplexityTier::High,
        ComplexityTier::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Trivial => "trivial",
            ComplexityTier::Low => "low",
            ComplexityTier::Medium => "medium",
            ComplexityTier::High => "high",
            ComplexityTier::Critical => "critical",
        }
    }
}

/// Capacity tier a task is billed against, cheapest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Local,
    Economy,
    Standard,
    Premium,
}

impl CostTier {
    /// The next cheaper tier, if any.
    pub fn cheaper(&self) -> Option<CostTier> {
        match self {
            CostTier::Local => None,
            CostTier::Economy => Some(CostTier::Local),
            CostTier::Standard => Some(CostTier::Economy),
            CostTier::Premium => Some(CostTier::Standard),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CostTier::Local => "local",
            CostTier::Economy => "economy",
            CostTier::Standard => "standard",
            CostTier::Premium => "premium",
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one TOML document per domain
    pub domains_dir: Option<PathBuf>,
    pub pool: PoolSettings,
    pub voting: VotingSettings,
    pub evaluation: EvaluationSettings,
    pub evolution: EvolutionSettings,
    pub budget: BudgetSettings,
    pub complexity: ComplexitySettings,
    pub persistence: PersistenceSettings,
}

/// Pool sizing and per-specialist bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    /// Number of recent scores kept per specialist
    pub score_window: usize,
    /// Recorded tasks required before a probation specialist can be promoted
    pub probation_tasks: u64,
    /// Window average required for promotion
    pub probation_threshold: f64,
    /// Recent failures retained for failure analysis
    pub failure_history: usize,
    /// Tasks per overload window before the overload penalty fires
    pub overload_threshold: u64,
    pub overload_window_secs: u64,
    pub default_happiness: f64,
    /// Finished task records kept for lookup and feedback
    pub max_task_records: usize,
    /// Age after which a finished task record is dropped
    pub task_retention_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 3,
            max_size: 8,
            score_window: 20,
            probation_tasks: 10,
            probation_threshold: 0.6,
            failure_history: 20,
            overload_threshold: 50,
            overload_window_secs: 3600,
            default_happiness: 60.0,
            max_task_records: 10_000,
            task_retention_secs: 86_400,
        }
    }
}

/// Council vote weighting and outlier rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VotingSettings {
    /// Average score at and below which the performance coefficient bottoms out
    pub floor_score: f64,
    /// Average score mapping to a coefficient of exactly 1.0
    pub pivot_score: f64,
    /// Average score at and above which the coefficient saturates
    pub ceiling_score: f64,
    pub min_coefficient: f64,
    pub max_coefficient: f64,
    pub outlier_sigma: f64,
    /// Lower bound on the spread used for outlier rejection
    pub min_spread: f64,
    pub min_votes: usize,
    /// Votes that must survive for rejection to apply
    pub min_survivors: usize,
    pub round_timeout_ms: u64,
    pub comparison_history: usize,
    pub agreement_tolerance: f64,
    pub bootstrap_generation: u64,
    pub bootstrap_min_score: f64,
    pub bootstrap_max_variance: f64,
}

impl Default for VotingSettings {
    fn default() -> Self {
        Self {
            floor_score: 0.2,
            pivot_score: 0.8,
            ceiling_score: 0.95,
            min_coefficient: 0.5,
            max_coefficient: 2.0,
            outlier_sigma: 2.0,
            min_spread: 0.05,
            min_votes: 2,
            min_survivors: 3,
            round_timeout_ms: 30_000,
            comparison_history: 500,
            agreement_tolerance: 0.1,
            bootstrap_generation: 3,
            bootstrap_min_score: 0.9,
            bootstrap_max_variance: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationSettings {
    pub mode: EvaluationMode,
    /// Domain whose top specialist joins every council
    pub admin_domain: String,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            mode: EvaluationMode::ScoringCommittee,
            admin_domain: "administration".to_string(),
        }
    }
}

/// Culling, spawning and convergence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolutionSettings {
    pub cull_threshold: f64,
    /// Completed tasks in a domain that trigger a cycle (0 disables)
    pub tasks_per_cycle: u64,
    /// Period of the background scheduler (0 disables)
    pub interval_secs: u64,
    pub cycle_timeout_ms: u64,
    pub convergence_max_variance: f64,
    /// Generations without improvement before a pool counts as converged
    pub convergence_patience: usize,
    pub convergence_min_best: f64,
    pub min_improvement: f64,
    /// Average a pool-mate needs for its learnings to become enhancements
    pub enhancement_threshold: f64,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            cull_threshold: 0.6,
            tasks_per_cycle: 25,
            interval_secs: 3600,
            cycle_timeout_ms: 5_000,
            convergence_max_variance: 0.02,
            convergence_patience: 10,
            convergence_min_best: 0.85,
            min_improvement: 0.001,
            enhancement_threshold: 0.8,
        }
    }
}

/// Dollar limits for one spend category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CategoryLimits {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetSettings {
    pub production: CategoryLimits,
    pub benchmark: CategoryLimits,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub overflow: OverflowBehavior,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            production: CategoryLimits {
                daily: 20.0,
                weekly: 100.0,
                monthly: 300.0,
            },
            benchmark: CategoryLimits {
                daily: 5.0,
                weekly: 25.0,
                monthly: 80.0,
            },
            warning_ratio: 0.8,
            critical_ratio: 0.95,
            overflow: OverflowBehavior::Reject,
        }
    }
}

/// Declarative complexity rules and cost tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComplexitySettings {
    /// Estimated financial impact at or above which a task is critical
    pub critical_financial_impact: f64,
    /// Estimated output tokens at or above which a task is at least high
    pub high_output_tokens: u64,
    /// Payloads shorter than this on low-priority tasks are trivial
    pub trivial_payload_chars: usize,
    /// Estimated dollar cost of one task per cost tier
    pub tier_costs: BTreeMap<CostTier, f64>,
    pub tier_table: BTreeMap<ComplexityTier, CostTier>,
    /// Used instead of `tier_table` when local capacity is available
    pub local_overrides: BTreeMap<ComplexityTier, CostTier>,
}

impl Default for ComplexitySettings {
    fn default() -> Self {
        let tier_costs = BTreeMap::from([
            (CostTier::Local, 0.0),
            (CostTier::Economy, 0.01),
            (CostTier::Standard, 0.05),
            (CostTier::Premium, 0.25),
        ]);
        let tier_table = BTreeMap::from([
            (ComplexityTier::Trivial, CostTier::Economy),
            (ComplexityTier::Low, CostTier::Economy),
            (ComplexityTier::Medium, CostTier::Standard),
            (ComplexityTier::High, CostTier::Premium),
            (ComplexityTier::Critical, CostTier::Premium),
        ]);
        let local_overrides = BTreeMap::from([
            (ComplexityTier::Trivial, CostTier::Local),
            (ComplexityTier::Low, CostTier::Local),
        ]);
        Self {
            critical_financial_impact: 10_000.0,
            high_output_tokens: 4_000,
            trivial_payload_chars: 200,
            tier_costs,
            tier_table,
            local_overrides,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PersistenceSettings {
    /// JSON snapshot of pools, graveyard, learnings and budget
    pub snapshot_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Parse settings from a TOML string and validate them.
    pub fn from_toml_str(content: &str, source_name: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from(source_name),
                source,
            })?;
        config.validate(source_name)?;
        Ok(config)
    }

    /// Load settings from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content, &path.display().to_string())?;

        // Relative domain directories resolve against the settings file.
        if let (Some(dir), Some(parent)) = (config.domains_dir.as_ref(), path.parent()) {
            if dir.is_relative() {
                config.domains_dir = Some(parent.join(dir));
            }
        }
        Ok(config)
    }

    /// Resolve settings: explicit path, then `EVOPOOL_CONFIG`, then the
    /// platform config directory, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            tracing::debug!("Loading settings from {}={}", CONFIG_ENV_VAR, path);
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = default_config_path() {
            if path.exists() {
                tracing::debug!("Loading settings from {}", path.display());
                return Self::from_file(&path);
            }
        }

        tracing::debug!("No settings file found, using defaults");
        Ok(Self::default())
    }

    /// Reject settings that cannot drive a working engine.
    pub fn validate(&self, source_name: &str) -> Result<()> {
        let pool = &self.pool;
        if pool.min_size == 0 {
            return Err(ConfigError::validation(source_name, "pool.min_size must be at least 1"));
        }
        if pool.min_size > pool.max_size {
            return Err(ConfigError::validation(
                source_name,
                format!(
                    "pool.min_size ({}) exceeds pool.max_size ({})",
                    pool.min_size, pool.max_size
                ),
            ));
        }
        if pool.score_window == 0 {
            return Err(ConfigError::validation(source_name, "pool.score_window must be at least 1"));
        }
        if pool.max_task_records == 0 {
            return Err(ConfigError::validation(
                source_name,
                "pool.max_task_records must be at least 1",
            ));
        }
        if !(0.0..=100.0).contains(&pool.default_happiness) {
            return Err(ConfigError::validation(
                source_name,
                "pool.default_happiness must lie in [0, 100]",
            ));
        }

        let voting = &self.voting;
        if !(voting.floor_score < voting.pivot_score && voting.pivot_score < voting.ceiling_score) {
            return Err(ConfigError::validation(
                source_name,
                "voting knots must satisfy floor_score < pivot_score < ceiling_score",
            ));
        }
        if voting.min_coefficient <= 0.0 || voting.min_coefficient > voting.max_coefficient {
            return Err(ConfigError::validation(
                source_name,
                "voting coefficients must satisfy 0 < min_coefficient <= max_coefficient",
            ));
        }
        if voting.min_votes == 0 {
            return Err(ConfigError::validation(source_name, "voting.min_votes must be at least 1"));
        }

        let budget = &self.budget;
        for (name, limits) in [("production", budget.production), ("benchmark", budget.benchmark)] {
            if limits.daily <= 0.0 || limits.weekly <= 0.0 || limits.monthly <= 0.0 {
                return Err(ConfigError::validation(
                    source_name,
                    format!("budget.{} limits must be positive", name),
                ));
            }
        }
        if !(0.0 < budget.warning_ratio
            && budget.warning_ratio <= budget.critical_ratio
            && budget.critical_ratio <= 1.0)
        {
            return Err(ConfigError::validation(
                source_name,
                "budget ratios must satisfy 0 < warning_ratio <= critical_ratio <= 1",
            ));
        }

        let complexity = &self.complexity;
        for tier in ComplexityTier::ALL {
            let cost_tier = complexity.tier_table.get(&tier).ok_or_else(|| {
                ConfigError::validation(
                    source_name,
                    format!("complexity.tier_table is missing '{}'", tier.as_str()),
                )
            })?;
            if !complexity.tier_costs.contains_key(cost_tier) {
                return Err(ConfigError::validation(
                    source_name,
                    format!("complexity.tier_costs is missing '{}'", cost_tier.as_str()),
                ));
            }
        }
        for cost_tier in complexity.local_overrides.values() {
            if !complexity.tier_costs.contains_key(cost_tier) {
                return Err(ConfigError::validation(
                    source_name,
                    format!("complexity.tier_costs is missing '{}'", cost_tier.as_str()),
                ));
            }
        }
        if complexity.tier_costs.values().any(|cost| *cost < 0.0) {
            return Err(ConfigError::validation(source_name, "complexity.tier_costs must be non-negative"));
        }

        Ok(())
    }

    /// Serialize the settings back to TOML (used by `evopool` to print defaults).
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Platform-specific location of `evopool.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "evopool", "evopool")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate("defaults").is_ok());
        assert_eq!(config.pool.min_size, 3);
        assert_eq!(config.evaluation.mode, EvaluationMode::ScoringCommittee);
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let content = include_str!("../../../evopool.example.toml");
        let config = EngineConfig::from_toml_str(content, "evopool.example.toml").unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(config.pool, defaults.pool);
        assert_eq!(config.budget, defaults.budget);
        assert_eq!(config.evolution, defaults.evolution);
        assert_eq!(config.domains_dir, Some(PathBuf::from("domains")));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            min_size = 2
            max_size = 4

            [budget]
            overflow = "downgrade"

            [budget.production]
            daily = 50.0
            weekly = 200.0
            monthly = 600.0

            [complexity.tier_table]
            trivial = "economy"
            low = "economy"
            medium = "economy"
            high = "standard"
            critical = "premium"
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.score_window, 20);
        assert_eq!(config.pool.max_task_records, 10_000);
        assert_eq!(config.budget.overflow, OverflowBehavior::Downgrade);
        assert_eq!(config.budget.production.daily, 50.0);
        assert_eq!(config.budget.benchmark.daily, 5.0);
        assert_eq!(
            config.complexity.tier_table.get(&ComplexityTier::High),
            Some(&CostTier::Standard)
        );
    }

    #[test]
    fn test_min_above_max_rejected() {
        let result = EngineConfig::from_toml_str("[pool]\nmin_size = 5\nmax_size = 2\n", "inline");
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_zero_task_records_rejected() {
        let result = EngineConfig::from_toml_str("[pool]\nmax_task_records = 0\n", "inline");
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_inverted_budget_ratios_rejected() {
        let result = EngineConfig::from_toml_str(
            "[budget]\nwarning_ratio = 0.99\ncritical_ratio = 0.5\n",
            "inline",
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = EngineConfig::from_toml_str("[pool\nmin_size = ", "inline");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_cost_tier_cheaper_chain() {
        assert_eq!(CostTier::Premium.cheaper(), Some(CostTier::Standard));
        assert_eq!(CostTier::Economy.cheaper(), Some(CostTier::Local));
        assert_eq!(CostTier::Local.cheaper(), None);
    }

    #[test]
    #[serial]
    fn test_load_from_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "domains_dir = \"domains\"\n[evaluation]\nmode = \"both\"").unwrap();

        unsafe {
            std::env::set_var(CONFIG_ENV_VAR, &path);
        }
        let config = EngineConfig::load(None);
        unsafe {
            std::env::remove_var(CONFIG_ENV_VAR);
        }

        let config = config.unwrap();
        assert_eq!(config.evaluation.mode, EvaluationMode::Both);
        assert_eq!(config.domains_dir, Some(dir.path().join("domains")));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = EngineConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text, "roundtrip").unwrap();
        assert_eq!(parsed, config);
    }
}
