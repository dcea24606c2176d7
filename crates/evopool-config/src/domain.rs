//! Per-domain configuration documents.
//!
//! A domain document describes everything the engine needs to run a pool
//! for one task domain: the specialist template new specialists are
//! spawned from, the scoring weights of the committee evaluator, and
//! optional seed enhancements. Documents are plain TOML:
//!
//! ```toml
//! name = "code_generation"
//! description = "Write and modify source code"
//! verification = ["tests", "lint"]
//! enhancements = ["Run the test suite before answering"]
//!
//! [template]
//! instructions = "You write small, well-tested changes."
//! temperature = 0.3
//! capabilities = ["filesystem", "shell"]
//!
//! [scoring.weights]
//! tests = 0.3
//! lint = 0.2
//! human = 0.5
//! ```

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Name of the human-rating check in scoring weight tables.
pub const HUMAN_CHECK: &str = "human";

/// Template every specialist of a domain starts from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistTemplate {
    /// Base system instructions
    pub instructions: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Capabilities enabled for specialists of this domain
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

fn default_temperature() -> f64 {
    0.7
}

/// Fixed weights of the objective checks for a domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            weights: BTreeMap::from([(HUMAN_CHECK.to_string(), 1.0)]),
        }
    }
}

/// Pool bounds overriding the engine-wide `[pool]` settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolBounds {
    pub min_size: usize,
    pub max_size: usize,
}

/// A declarative domain descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainDocument {
    /// Domain key (lowercase letters, digits, `_` and `-`)
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub template: SpecialistTemplate,

    #[serde(default)]
    pub scoring: ScoringWeights,

    /// Names of the verification rules applied to results of this domain
    #[serde(default)]
    pub verification: Vec<String>,

    /// Seed instructions injected into every spawned specialist
    #[serde(default)]
    pub enhancements: Vec<String>,

    #[serde(default)]
    pub pool: Option<PoolBounds>,
}

impl DomainDocument {
    /// Create a minimal document with human-only scoring.
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            template: SpecialistTemplate {
                instructions: instructions.into(),
                temperature: default_temperature(),
                capabilities: BTreeSet::new(),
            },
            scoring: ScoringWeights::default(),
            verification: Vec::new(),
            enhancements: Vec::new(),
            pool: None,
        }
    }

    /// Replace the scoring weights.
    pub fn with_weights<I, S>(mut self, weights: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.scoring.weights = weights.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Override the pool bounds.
    pub fn with_pool_bounds(mut self, min_size: usize, max_size: usize) -> Self {
        self.pool = Some(PoolBounds { min_size, max_size });
        self
    }

    /// Add seed enhancements.
    pub fn with_enhancements(mut self, enhancements: Vec<String>) -> Self {
        self.enhancements = enhancements;
        self
    }

    /// Parse and validate a document from TOML text.
    pub fn from_toml_str(content: &str, source_name: &str) -> Result<Self> {
        let document: DomainDocument =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: source_name.into(),
                source,
            })?;
        document.validate(source_name)?;
        Ok(document)
    }

    /// Read, parse and validate a document file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Check the document is usable as a spawn template and scoring table.
    pub fn validate(&self, source_name: &str) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConfigError::validation(source_name, "domain name is empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(ConfigError::validation(
                source_name,
                format!("domain name '{}' contains invalid characters", self.name),
            ));
        }
        if self.template.instructions.trim().is_empty() {
            return Err(ConfigError::validation(
                source_name,
                format!("domain '{}' has empty template instructions", self.name),
            ));
        }
        if !(0.0..=2.0).contains(&self.template.temperature) {
            return Err(ConfigError::validation(
                source_name,
                format!(
                    "domain '{}' temperature {} outside [0, 2]",
                    self.name, self.template.temperature
                ),
            ));
        }
        if self.scoring.weights.is_empty() {
            return Err(ConfigError::validation(
                source_name,
                format!("domain '{}' declares no scoring weights", self.name),
            ));
        }
        if let Some((check, weight)) = self
            .scoring
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(ConfigError::validation(
                source_name,
                format!("domain '{}' weight for '{}' is invalid: {}", self.name, check, weight),
            ));
        }
        if self.scoring.weights.values().sum::<f64>() <= 0.0 {
            return Err(ConfigError::validation(
                source_name,
                format!("domain '{}' scoring weights sum to zero", self.name),
            ));
        }
        if let Some(bounds) = self.pool {
            if bounds.min_size == 0 || bounds.min_size > bounds.max_size {
                return Err(ConfigError::validation(
                    source_name,
                    format!(
                        "domain '{}' pool bounds [{}, {}] are invalid",
                        self.name, bounds.min_size, bounds.max_size
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Effective pool bounds given the engine-wide defaults.
    pub fn pool_bounds(&self, default_min: usize, default_max: usize) -> (usize, usize) {
        match self.pool {
            Some(bounds) => (bounds.min_size, bounds.max_size),
            None => (default_min, default_max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODEGEN: &str = r#"
        name = "code_generation"
        description = "Write code"
        verification = ["tests", "lint"]

        [template]
        instructions = "You write small, well-tested changes."
        temperature = 0.3
        capabilities = ["filesystem", "shell"]

        [scoring.weights]
        tests = 0.3
        lint = 0.2
        human = 0.5
    "#;

    #[test]
    fn test_parse_document() {
        let doc = DomainDocument::from_toml_str(CODEGEN, "codegen.toml").unwrap();
        assert_eq!(doc.name, "code_generation");
        assert_eq!(doc.template.temperature, 0.3);
        assert!(doc.template.capabilities.contains("shell"));
        assert_eq!(doc.scoring.weights.get("tests"), Some(&0.3));
        assert!(doc.pool.is_none());
    }

    #[test]
    fn test_default_scoring_is_human_only() {
        let doc = DomainDocument::from_toml_str(
            "name = \"administration\"\n[template]\ninstructions = \"Keep the books.\"\n",
            "admin.toml",
        )
        .unwrap();
        assert_eq!(doc.scoring.weights.len(), 1);
        assert_eq!(doc.scoring.weights.get(HUMAN_CHECK), Some(&1.0));
    }

    #[test]
    fn test_empty_instructions_rejected() {
        let doc = DomainDocument::new("support", "   ");
        assert!(matches!(doc.validate("inline"), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let doc = DomainDocument::new("Code Gen", "Write code");
        assert!(doc.validate("inline").is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let doc = DomainDocument::new("support", "Help users").with_weights([("human", -1.0)]);
        assert!(doc.validate("inline").is_err());
    }

    #[test]
    fn test_pool_bounds_override() {
        let doc = DomainDocument::new("support", "Help users").with_pool_bounds(2, 4);
        assert!(doc.validate("inline").is_ok());
        assert_eq!(doc.pool_bounds(3, 8), (2, 4));

        let doc = DomainDocument::new("support", "Help users").with_pool_bounds(5, 4);
        assert!(doc.validate("inline").is_err());
    }
}
