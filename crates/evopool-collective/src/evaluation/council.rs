//! Peer council evaluation.

use super::{
    EvaluationContext, EvaluationOutcome, EvaluationResult, Evaluator, EvaluatorKind,
    BOOTSTRAP_WARNING,
};
use crate::executor::CouncilVoter;
use crate::types::Result;
use crate::voting::{Ballot, RoundOutcome, Vote, VoteAggregator};
use async_trait::async_trait;
use chrono::Utc;
use evopool_config::VotingSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

const COUNCIL_CONFIDENCE: f64 = 0.8;
const BOOTSTRAP_CONFIDENCE: f64 = 0.3;

/// Collects votes from the council seats and aggregates them.
pub struct CouncilEvaluator {
    voter: Arc<dyn CouncilVoter>,
    aggregator: VoteAggregator,
    round_timeout: Duration,
}

impl CouncilEvaluator {
    pub fn new(voter: Arc<dyn CouncilVoter>, settings: VotingSettings) -> Self {
        let round_timeout = Duration::from_millis(settings.round_timeout_ms);
        Self {
            voter,
            aggregator: VoteAggregator::new(settings),
            round_timeout,
        }
    }

    pub fn aggregator(&self) -> &VoteAggregator {
        &self.aggregator
    }

    /// Poll every seat concurrently; the round closes at the deadline.
    async fn collect(&self, ctx: &EvaluationContext<'_>) -> Vec<Ballot> {
        let deadline = Instant::now() + self.round_timeout;
        let requests = ctx.seats.iter().map(|seat| async move {
            let result = timeout_at(
                deadline,
                self.voter.vote(&seat.specialist, ctx.task, ctx.output),
            )
            .await;
            (seat, result)
        });

        let mut ballots = Vec::new();
        for (seat, result) in futures::future::join_all(requests).await {
            match result {
                Ok(Ok(draft)) if draft.score.is_finite() => ballots.push(Ballot {
                    vote: Vote {
                        voter_id: seat.specialist.id.clone(),
                        kind: seat.kind,
                        score: draft.score.clamp(0.0, 1.0),
                        rationale: draft.rationale,
                        cast_at: Utc::now(),
                    },
                    voter_average: seat.specialist.average(),
                    voter_happiness: seat.specialist.happiness,
                }),
                Ok(Ok(draft)) => tracing::warn!(
                    "Discarding non-finite vote {} from {}",
                    draft.score,
                    seat.specialist.id
                ),
                Ok(Err(e)) => tracing::warn!(
                    "Voter {} failed on task {}: {}",
                    seat.specialist.id,
                    ctx.task.id,
                    e
                ),
                Err(_) => tracing::warn!(
                    "Voter {} missed the round deadline for task {}",
                    seat.specialist.id,
                    ctx.task.id
                ),
            }
        }
        ballots
    }

    /// Early-generation rounds where everyone agrees on a high score.
    fn is_bootstrap_biased(&self, round: &RoundOutcome, generation: u64) -> bool {
        let s = self.aggregator.settings();
        generation < s.bootstrap_generation
            && round.min_score() > s.bootstrap_min_score
            && round.variance < s.bootstrap_max_variance
    }
}

#[async_trait]
impl Evaluator for CouncilEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::AiCouncil
    }

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<EvaluationOutcome> {
        let ballots = self.collect(ctx).await;
        let round = self.aggregator.aggregate(&ballots)?;

        let biased = self.is_bootstrap_biased(&round, ctx.pool_generation);
        let confidence = if biased {
            tracing::warn!(
                "Bootstrap bias suspected on task {} (generation {}, variance {:.4})",
                ctx.task.id,
                ctx.pool_generation,
                round.variance
            );
            BOOTSTRAP_CONFIDENCE
        } else {
            COUNCIL_CONFIDENCE
        };

        let mut result = EvaluationResult::new(round.score, confidence, EvaluatorKind::AiCouncil);
        result.components = round
            .survivors
            .iter()
            .map(|v| (v.voter_id.clone(), v.score))
            .collect();
        result
            .metadata
            .insert(BOOTSTRAP_WARNING.to_string(), serde_json::Value::Bool(biased));
        result.metadata.insert(
            "votes_received".to_string(),
            serde_json::Value::from(ballots.len()),
        );
        result.metadata.insert(
            "votes_rejected".to_string(),
            serde_json::Value::from(round.rejected.len()),
        );

        Ok(EvaluationOutcome {
            result,
            round: Some(round),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::task::{Task, TaskOutput};
    use crate::types::EngineError;
    use crate::voting::VoterKind;
    use evopool_config::ScoringWeights;
    use serde_json::json;
    use std::collections::HashMap;

    async fn run(
        voter: ScriptedVoter,
        seats: &[super::super::CouncilSeat],
        generation: u64,
        settings: VotingSettings,
    ) -> Result<EvaluationOutcome> {
        let council = CouncilEvaluator::new(Arc::new(voter), settings);
        let task = Task::new("support", json!("q"));
        let output = TaskOutput::success(json!("a"));
        let weights = ScoringWeights::default();
        let ctx = EvaluationContext {
            task: &task,
            output: &output,
            weights: &weights,
            feedback: None,
            pool_generation: generation,
            seats,
        };
        council.evaluate(&ctx).await
    }

    fn three_seats() -> Vec<super::super::CouncilSeat> {
        vec![
            seat("a", 0.8, VoterKind::Specialist),
            seat("b", 0.8, VoterKind::Specialist),
            seat("admin", 0.8, VoterKind::Admin),
        ]
    }

    #[tokio::test]
    async fn test_bootstrap_bias_flagged_in_early_generation() {
        let voter = ScriptedVoter::new(HashMap::from([
            ("a".to_string(), 0.95),
            ("b".to_string(), 0.96),
            ("admin".to_string(), 0.94),
        ]));
        let outcome = run(voter, &three_seats(), 2, VotingSettings::default())
            .await
            .unwrap();
        assert!(outcome.result.bootstrap_warning());
        assert!((outcome.result.confidence - 0.3).abs() < 1e-12);
        assert!((outcome.result.score - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_same_votes_later_generation_not_flagged() {
        let voter = ScriptedVoter::new(HashMap::from([
            ("a".to_string(), 0.95),
            ("b".to_string(), 0.96),
            ("admin".to_string(), 0.94),
        ]));
        let outcome = run(voter, &three_seats(), 3, VotingSettings::default())
            .await
            .unwrap();
        assert!(!outcome.result.bootstrap_warning());
        assert!((outcome.result.confidence - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_failed_voters_are_excluded() {
        let voter = ScriptedVoter::new(HashMap::from([
            ("a".to_string(), 0.6),
            ("b".to_string(), 0.7),
        ]));
        let outcome = run(voter, &three_seats(), 5, VotingSettings::default())
            .await
            .unwrap();
        let round = outcome.round.unwrap();
        assert_eq!(round.survivors.len(), 2);
        assert_eq!(outcome.result.metadata["votes_received"], json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_voters_miss_the_round() {
        let mut voter = ScriptedVoter::new(HashMap::from([
            ("a".to_string(), 0.6),
            ("b".to_string(), 0.7),
            ("admin".to_string(), 0.8),
        ]));
        voter
            .delay
            .insert("admin".to_string(), std::time::Duration::from_secs(60));
        let settings = VotingSettings {
            round_timeout_ms: 1_000,
            ..VotingSettings::default()
        };
        let outcome = run(voter, &three_seats(), 5, settings).await.unwrap();
        let round = outcome.round.unwrap();
        assert!(round.survivors.iter().all(|v| v.voter_id != "admin"));
    }

    #[tokio::test]
    async fn test_too_few_votes_is_inconclusive() {
        let voter = ScriptedVoter::new(HashMap::from([("a".to_string(), 0.6)]));
        let err = run(voter, &three_seats(), 5, VotingSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientVotes { .. }));
    }
}
