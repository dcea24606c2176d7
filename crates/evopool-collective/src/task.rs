//! Tasks, their outputs, and human feedback.

use crate::budget::{BudgetCategory, Usd};
use crate::evaluation::EvaluationResult;
use crate::types::{Domain, SpecialistId, TaskId};
use chrono::{DateTime, Utc};
use evopool_config::{ComplexityTier, CostTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority level of a task.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Optional hints used by complexity classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComplexitySignals {
    /// Tier declared by the submitter; classification never goes below it
    #[serde(default)]
    pub declared: Option<ComplexityTier>,
    #[serde(default)]
    pub financial_impact: Option<f64>,
    #[serde(default)]
    pub expected_output_tokens: Option<u64>,
}

/// A unit of work submitted to a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub domain: Domain,
    /// Free-form kind label used when grouping failures
    #[serde(default)]
    pub kind: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub category: BudgetCategory,
    #[serde(default)]
    pub signals: ComplexitySignals,
    /// Route to this specialist instead of using the selection mode
    #[serde(default)]
    pub pinned_specialist: Option<SpecialistId>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(domain: impl Into<Domain>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain: domain.into(),
            kind: None,
            payload,
            priority: TaskPriority::Normal,
            category: BudgetCategory::Production,
            signals: ComplexitySignals::default(),
            pinned_specialist: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: BudgetCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_signals(mut self, signals: ComplexitySignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn pinned_to(mut self, specialist_id: impl Into<SpecialistId>) -> Self {
        self.pinned_specialist = Some(specialist_id.into());
        self
    }

    /// Serialized payload length, used as a size signal.
    pub fn payload_chars(&self) -> usize {
        serde_json::to_string(&self.payload)
            .map(|s| s.chars().count())
            .unwrap_or(usize::MAX)
    }
}

/// What a specialist produced for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub succeeded: bool,
    #[serde(default)]
    pub content: serde_json::Value,
    /// Objective check results in `[0, 1]`, keyed by check name
    #[serde(default)]
    pub checks: BTreeMap<String, f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_errors: Vec<String>,
    /// Insights the specialist wants to pass on
    #[serde(default)]
    pub learnings: Vec<String>,
}

impl TaskOutput {
    pub fn success(content: serde_json::Value) -> Self {
        Self {
            succeeded: true,
            content,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_check(mut self, name: impl Into<String>, value: f64) -> Self {
        self.checks.insert(name.into(), value.clamp(0.0, 1.0));
        self
    }

    pub fn with_tool_error(mut self, error: impl Into<String>) -> Self {
        self.tool_errors.push(error.into());
        self
    }

    pub fn with_learning(mut self, learning: impl Into<String>) -> Self {
        self.learnings.push(learning.into());
        self
    }

    /// Checks that scored below one half.
    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|(_, v)| **v < 0.5)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// How much a human had to edit the result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditSeverity {
    #[default]
    None,
    Minor,
    Moderate,
    Major,
}

impl EditSeverity {
    pub fn factor(&self) -> f64 {
        match self {
            EditSeverity::None => 1.0,
            EditSeverity::Minor => 0.9,
            EditSeverity::Moderate => 0.7,
            EditSeverity::Major => 0.5,
        }
    }
}

/// Human rating of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanFeedback {
    /// 1 to 5 stars
    pub rating: u8,
    pub worked: bool,
    #[serde(default)]
    pub edits: EditSeverity,
    #[serde(default)]
    pub comment: Option<String>,
    /// Grant the specialist a happiness bonus
    #[serde(default)]
    pub bonus: bool,
}

impl HumanFeedback {
    pub fn new(rating: u8, worked: bool) -> Self {
        Self {
            rating,
            worked,
            edits: EditSeverity::None,
            comment: None,
            bonus: false,
        }
    }

    pub fn with_edits(mut self, edits: EditSeverity) -> Self {
        self.edits = edits;
        self
    }

    pub fn with_bonus(mut self) -> Self {
        self.bonus = true;
        self
    }

    /// Normalized score: rating/5, halved if the result did not work,
    /// scaled down by edit severity.
    pub fn score(&self) -> f64 {
        let mut score = f64::from(self.rating.clamp(1, 5)) / 5.0;
        if !self.worked {
            score *= 0.5;
        }
        (score * self.edits.factor()).clamp(0.0, 1.0)
    }
}

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Parked until a budget window resets
    Deferred { until: DateTime<Utc> },
    Running { specialist_id: SpecialistId },
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

/// Everything the engine knows about one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub complexity: ComplexityTier,
    pub cost_tier: CostTier,
    pub cost: Usd,
    pub specialist_id: Option<SpecialistId>,
    pub output: Option<TaskOutput>,
    pub evaluation: Option<EvaluationResult>,
    pub feedback: Option<HumanFeedback>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn score(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|e| e.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_human_score() {
        assert!((HumanFeedback::new(5, true).score() - 1.0).abs() < 1e-12);
        assert!((HumanFeedback::new(4, false).score() - 0.4).abs() < 1e-12);
        let edited = HumanFeedback::new(5, true).with_edits(EditSeverity::Moderate);
        assert!((edited.score() - 0.7).abs() < 1e-12);
        // Out-of-range ratings are clamped.
        assert!((HumanFeedback::new(0, true).score() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_failed_checks() {
        let output = TaskOutput::success(json!("ok"))
            .with_check("tests", 0.2)
            .with_check("lint", 1.0);
        assert_eq!(output.failed_checks(), vec!["tests".to_string()]);
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("support", json!({"q": "reset password"}))
            .with_priority(TaskPriority::High)
            .with_category(BudgetCategory::Benchmark)
            .pinned_to("spec-1");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.category, BudgetCategory::Benchmark);
        assert_eq!(task.pinned_specialist.as_deref(), Some("spec-1"));
        assert!(task.payload_chars() > 10);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Deferred { until: Utc::now() }.is_terminal());
    }
}
