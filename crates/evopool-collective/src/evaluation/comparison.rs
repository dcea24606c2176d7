//! Running both evaluators side by side.

use super::{
    CouncilEvaluator, EvaluationContext, EvaluationOutcome, Evaluator, EvaluatorKind,
    ScoringCommittee,
};
use crate::types::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Bounded history of (committee, council) score pairs.
#[derive(Debug, Clone)]
pub struct ComparisonStats {
    pairs: VecDeque<(f64, f64)>,
    capacity: usize,
    tolerance: f64,
}

/// Agreement between the two evaluators over the retained history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonSummary {
    pub pairs: usize,
    /// Fraction of pairs within the tolerance of each other
    pub agreement_rate: f64,
    /// Mean of committee minus council
    pub mean_difference: f64,
    /// Pearson correlation; `None` with fewer than two pairs or no variance
    pub correlation: Option<f64>,
}

impl ComparisonStats {
    pub fn new(capacity: usize, tolerance: f64) -> Self {
        Self {
            pairs: VecDeque::new(),
            capacity: capacity.max(1),
            tolerance,
        }
    }

    pub fn record(&mut self, committee: f64, council: f64) {
        self.pairs.push_back((committee, council));
        while self.pairs.len() > self.capacity {
            self.pairs.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn summary(&self) -> ComparisonSummary {
        let n = self.pairs.len();
        if n == 0 {
            return ComparisonSummary {
                pairs: 0,
                agreement_rate: 0.0,
                mean_difference: 0.0,
                correlation: None,
            };
        }
        let nf = n as f64;
        let agreeing = self
            .pairs
            .iter()
            .filter(|(a, b)| (a - b).abs() <= self.tolerance)
            .count();
        let mean_difference = self.pairs.iter().map(|(a, b)| a - b).sum::<f64>() / nf;

        ComparisonSummary {
            pairs: n,
            agreement_rate: agreeing as f64 / nf,
            mean_difference,
            correlation: self.correlation(),
        }
    }

    fn correlation(&self) -> Option<f64> {
        let n = self.pairs.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let mean_a = self.pairs.iter().map(|(a, _)| a).sum::<f64>() / nf;
        let mean_b = self.pairs.iter().map(|(_, b)| b).sum::<f64>() / nf;
        let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
        for (a, b) in &self.pairs {
            cov += (a - mean_a) * (b - mean_b);
            var_a += (a - mean_a).powi(2);
            var_b += (b - mean_b).powi(2);
        }
        let denom = (var_a * var_b).sqrt();
        if denom <= f64::EPSILON {
            return None;
        }
        Some((cov / denom).clamp(-1.0, 1.0))
    }
}

/// Composite evaluator: committee result is returned, council result is recorded.
pub struct ComparativeEvaluator {
    committee: Arc<ScoringCommittee>,
    council: Arc<CouncilEvaluator>,
    stats: Mutex<ComparisonStats>,
}

impl ComparativeEvaluator {
    pub fn new(
        committee: Arc<ScoringCommittee>,
        council: Arc<CouncilEvaluator>,
        stats: ComparisonStats,
    ) -> Self {
        Self {
            committee,
            council,
            stats: Mutex::new(stats),
        }
    }

    pub fn summary(&self) -> ComparisonSummary {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
    }
}

#[async_trait]
impl Evaluator for ComparativeEvaluator {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ScoringCommittee
    }

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<EvaluationOutcome> {
        let (committee, council) =
            futures::join!(self.committee.evaluate(ctx), self.council.evaluate(ctx));
        let mut outcome = committee?;

        match council {
            Ok(council) => {
                self.stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(outcome.result.score, council.result.score);
                outcome.result.metadata.insert(
                    "council_score".to_string(),
                    serde_json::Value::from(council.result.score),
                );
                outcome.round = council.round;
            }
            Err(EngineError::InsufficientVotes { required, received }) => {
                tracing::debug!(
                    "No comparison for task {}: council got {} of {} votes",
                    ctx.task.id,
                    received,
                    required
                );
            }
            Err(e) => return Err(e),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let stats = ComparisonStats::new(10, 0.1);
        let summary = stats.summary();
        assert_eq!(summary.pairs, 0);
        assert!(summary.correlation.is_none());
    }

    #[test]
    fn test_agreement_and_difference() {
        let mut stats = ComparisonStats::new(10, 0.1);
        stats.record(0.8, 0.75);
        stats.record(0.6, 0.9);
        stats.record(0.5, 0.45);
        stats.record(0.9, 0.2);
        let summary = stats.summary();
        assert_eq!(summary.pairs, 4);
        assert!((summary.agreement_rate - 0.5).abs() < 1e-12);
        // (0.05 - 0.3 + 0.05 + 0.7) / 4
        assert!((summary.mean_difference - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_perfect_correlation() {
        let mut stats = ComparisonStats::new(10, 0.1);
        for i in 0..5 {
            let x = i as f64 / 10.0;
            stats.record(x, x * 0.5 + 0.2);
        }
        let r = stats.summary().correlation.unwrap();
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_series_has_no_correlation() {
        let mut stats = ComparisonStats::new(10, 0.1);
        stats.record(0.5, 0.1);
        stats.record(0.5, 0.9);
        assert!(stats.summary().correlation.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut stats = ComparisonStats::new(3, 0.1);
        for _ in 0..10 {
            stats.record(0.5, 0.5);
        }
        assert_eq!(stats.len(), 3);
    }
}
