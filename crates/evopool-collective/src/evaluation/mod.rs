//! Evaluation strategies.
//!
//! Three ways to score a finished task, selected at runtime by
//! [`EvaluationMode`]:
//!
//! - [`ScoringCommittee`]: weighted objective checks plus the human rating.
//! - [`CouncilEvaluator`]: peer specialists vote through the
//!   [`VoteAggregator`](crate::voting::VoteAggregator).
//! - [`ComparativeEvaluator`]: runs both; the committee is authoritative
//!   and the council result only feeds [`ComparisonStats`].

pub mod committee;
pub mod comparison;
pub mod council;

pub use committee::ScoringCommittee;
pub use comparison::{ComparativeEvaluator, ComparisonStats, ComparisonSummary};
pub use council::CouncilEvaluator;

use crate::specialist::Specialist;
use crate::task::{HumanFeedback, Task, TaskOutput};
use crate::types::{EngineError, Result};
use crate::voting::{RoundOutcome, VoterKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evopool_config::{EvaluationMode, ScoringWeights};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Metadata key set when a council round looks like early-generation rubber-stamping.
pub const BOOTSTRAP_WARNING: &str = "bootstrap_warning";

/// Metadata key set when the council was inconclusive and the committee scored instead.
pub const COUNCIL_FALLBACK: &str = "council_fallback";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    ScoringCommittee,
    AiCouncil,
}

/// Score of a task result in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub score: f64,
    /// Per-check or per-voter contributions
    pub components: BTreeMap<String, f64>,
    pub confidence: f64,
    pub evaluator: EvaluatorKind,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn new(score: f64, confidence: f64, evaluator: EvaluatorKind) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            components: BTreeMap::new(),
            confidence: confidence.clamp(0.0, 1.0),
            evaluator,
            metadata: BTreeMap::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn bootstrap_warning(&self) -> bool {
        self.flag(BOOTSTRAP_WARNING)
    }
}

/// A specialist asked to vote, and in which role.
#[derive(Debug, Clone)]
pub struct CouncilSeat {
    pub specialist: Specialist,
    pub kind: VoterKind,
}

/// Inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub task: &'a Task,
    pub output: &'a TaskOutput,
    pub weights: &'a ScoringWeights,
    pub feedback: Option<&'a HumanFeedback>,
    /// Generation of the task's domain pool
    pub pool_generation: u64,
    pub seats: &'a [CouncilSeat],
}

/// Authoritative result plus the council round, when one ran.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub result: EvaluationResult,
    pub round: Option<RoundOutcome>,
}

impl From<EvaluationResult> for EvaluationOutcome {
    fn from(result: EvaluationResult) -> Self {
        Self {
            result,
            round: None,
        }
    }
}

/// A strategy that scores a finished task.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> EvaluatorKind;

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<EvaluationOutcome>;
}

/// Picks the evaluator for each task according to the current mode.
pub struct EvaluationController {
    mode: RwLock<EvaluationMode>,
    committee: Arc<ScoringCommittee>,
    council: Arc<CouncilEvaluator>,
    comparative: ComparativeEvaluator,
}

impl EvaluationController {
    pub fn new(
        mode: EvaluationMode,
        committee: Arc<ScoringCommittee>,
        council: Arc<CouncilEvaluator>,
        comparison_history: usize,
        agreement_tolerance: f64,
    ) -> Self {
        let comparative = ComparativeEvaluator::new(
            Arc::clone(&committee),
            Arc::clone(&council),
            ComparisonStats::new(comparison_history, agreement_tolerance),
        );
        Self {
            mode: RwLock::new(mode),
            committee,
            council,
            comparative,
        }
    }

    pub fn mode(&self) -> EvaluationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: EvaluationMode) {
        let mut current = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        if *current != mode {
            tracing::info!(
                "Evaluation mode changed from {} to {}",
                current.as_str(),
                mode.as_str()
            );
        }
        *current = mode;
    }

    pub fn committee(&self) -> &ScoringCommittee {
        &self.committee
    }

    pub fn comparison(&self) -> ComparisonSummary {
        self.comparative.summary()
    }

    /// Evaluate with the current mode.
    ///
    /// An inconclusive council round in `AiCouncil` mode falls back to the
    /// committee and marks the result with [`COUNCIL_FALLBACK`].
    pub async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<EvaluationOutcome> {
        match self.mode() {
            EvaluationMode::ScoringCommittee => self.committee.evaluate(ctx).await,
            EvaluationMode::Both => self.comparative.evaluate(ctx).await,
            EvaluationMode::AiCouncil => match self.council.evaluate(ctx).await {
                Err(EngineError::InsufficientVotes { required, received }) => {
                    tracing::warn!(
                        "Council round for task {} inconclusive ({} of {} votes); using committee",
                        ctx.task.id,
                        received,
                        required
                    );
                    let mut outcome = self.committee.evaluate(ctx).await?;
                    outcome
                        .result
                        .metadata
                        .insert(COUNCIL_FALLBACK.to_string(), serde_json::Value::Bool(true));
                    Ok(outcome)
                }
                other => other,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::executor::{CouncilVoter, VoteDraft};
    use crate::specialist::SpecialistStatus;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Voter returning a fixed score per voter id; unknown voters fail.
    pub struct ScriptedVoter {
        pub scores: HashMap<String, f64>,
        pub delay: HashMap<String, Duration>,
    }

    impl ScriptedVoter {
        pub fn new(scores: HashMap<String, f64>) -> Self {
            Self {
                scores,
                delay: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl CouncilVoter for ScriptedVoter {
        async fn vote(
            &self,
            voter: &Specialist,
            _task: &Task,
            _output: &TaskOutput,
        ) -> anyhow::Result<VoteDraft> {
            if let Some(delay) = self.delay.get(&voter.id) {
                tokio::time::sleep(*delay).await;
            }
            self.scores
                .get(&voter.id)
                .map(|s| VoteDraft::new(*s))
                .ok_or_else(|| anyhow::anyhow!("voter {} unavailable", voter.id))
        }
    }

    pub fn seat(id: &str, average: f64, kind: VoterKind) -> CouncilSeat {
        let mut specialist = crate::pool::scored_specialist("support", SpecialistStatus::Active, &[average]);
        specialist.id = id.to_string();
        CouncilSeat { specialist, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use evopool_config::VotingSettings;
    use serde_json::json;
    use std::collections::HashMap;

    fn controller(mode: EvaluationMode, scores: HashMap<String, f64>) -> EvaluationController {
        let council = CouncilEvaluator::new(
            Arc::new(ScriptedVoter::new(scores)),
            VotingSettings::default(),
        );
        EvaluationController::new(
            mode,
            Arc::new(ScoringCommittee::new()),
            Arc::new(council),
            100,
            0.1,
        )
    }

    #[tokio::test]
    async fn test_council_mode_falls_back_to_committee() {
        let controller = controller(EvaluationMode::AiCouncil, HashMap::new());
        let task = Task::new("support", json!("q"));
        let output = TaskOutput::success(json!("a")).with_check("tests", 1.0);
        let weights = ScoringWeights {
            weights: [("tests".to_string(), 1.0)].into_iter().collect(),
        };
        let seats = vec![seat("a", 0.8, VoterKind::Specialist)];
        let ctx = EvaluationContext {
            task: &task,
            output: &output,
            weights: &weights,
            feedback: None,
            pool_generation: 5,
            seats: &seats,
        };

        let outcome = controller.evaluate(&ctx).await.unwrap();
        assert_eq!(outcome.result.evaluator, EvaluatorKind::ScoringCommittee);
        assert!(outcome.result.flag(COUNCIL_FALLBACK));
        assert!((outcome.result.score - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_both_mode_keeps_committee_authoritative() {
        let scores = HashMap::from([("a".to_string(), 0.2), ("b".to_string(), 0.3)]);
        let controller = controller(EvaluationMode::Both, scores);
        let task = Task::new("support", json!("q"));
        let output = TaskOutput::success(json!("a")).with_check("tests", 0.9);
        let weights = ScoringWeights {
            weights: [("tests".to_string(), 1.0)].into_iter().collect(),
        };
        let seats = vec![
            seat("a", 0.8, VoterKind::Specialist),
            seat("b", 0.8, VoterKind::Admin),
        ];
        let ctx = EvaluationContext {
            task: &task,
            output: &output,
            weights: &weights,
            feedback: None,
            pool_generation: 5,
            seats: &seats,
        };

        let outcome = controller.evaluate(&ctx).await.unwrap();
        assert_eq!(outcome.result.evaluator, EvaluatorKind::ScoringCommittee);
        assert!((outcome.result.score - 0.9).abs() < 1e-12);
        assert!(outcome.round.is_some());

        let summary = controller.comparison();
        assert_eq!(summary.pairs, 1);
        assert_eq!(summary.agreement_rate, 0.0);
    }

    #[test]
    fn test_set_mode() {
        let controller = controller(EvaluationMode::ScoringCommittee, HashMap::new());
        controller.set_mode(EvaluationMode::Both);
        assert_eq!(controller.mode(), EvaluationMode::Both);
    }
}
