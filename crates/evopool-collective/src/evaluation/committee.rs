//! Objective-check scoring.

use super::{EvaluationContext, EvaluationOutcome, EvaluationResult, Evaluator, EvaluatorKind};
use crate::task::HumanFeedback;
use crate::types::Result;
use async_trait::async_trait;
use evopool_config::{ScoringWeights, HUMAN_CHECK};
use std::collections::BTreeMap;

/// Metadata key set when no weighted check was available.
pub const UNRATED: &str = "unrated";

/// Provisional score of a successful task with no checks and no rating yet.
const UNRATED_SUCCESS_SCORE: f64 = 0.7;
const UNRATED_CONFIDENCE: f64 = 0.2;

/// Combines objective sub-checks and the human rating with fixed domain weights.
///
/// Weights of missing checks are redistributed proportionally over the
/// present ones; the share of weight actually present becomes the
/// confidence.
#[derive(Debug, Clone, Default)]
pub struct ScoringCommittee;

impl ScoringCommittee {
    pub fn new() -> Self {
        Self
    }

    pub fn score(
        &self,
        weights: &ScoringWeights,
        checks: &BTreeMap<String, f64>,
        feedback: Option<&HumanFeedback>,
        succeeded: bool,
    ) -> EvaluationResult {
        let total_weight: f64 = weights.weights.values().sum();
        let mut components = BTreeMap::new();
        let mut present_weight = 0.0;
        let mut weighted_sum = 0.0;

        for (check, weight) in &weights.weights {
            let value = if check == HUMAN_CHECK {
                feedback.map(HumanFeedback::score)
            } else {
                checks.get(check).copied()
            };
            if let Some(value) = value {
                let value = value.clamp(0.0, 1.0);
                components.insert(check.clone(), value);
                present_weight += weight;
                weighted_sum += weight * value;
            }
        }

        if present_weight <= 0.0 || total_weight <= 0.0 {
            let score = if succeeded { UNRATED_SUCCESS_SCORE } else { 0.0 };
            let mut result =
                EvaluationResult::new(score, UNRATED_CONFIDENCE, EvaluatorKind::ScoringCommittee);
            result
                .metadata
                .insert(UNRATED.to_string(), serde_json::Value::Bool(true));
            return result;
        }

        let mut result = EvaluationResult::new(
            weighted_sum / present_weight,
            present_weight / total_weight,
            EvaluatorKind::ScoringCommittee,
        );
        result.components = components;
        result
    }
}

#[async_trait]
impl Evaluator for ScoringCommittee {
    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::ScoringCommittee
    }

    async fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<EvaluationOutcome> {
        Ok(self
            .score(ctx.weights, &ctx.output.checks, ctx.feedback, ctx.output.succeeded)
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::EditSeverity;

    fn codegen_weights() -> ScoringWeights {
        ScoringWeights {
            weights: [
                ("tests".to_string(), 0.3),
                ("lint".to_string(), 0.2),
                (HUMAN_CHECK.to_string(), 0.5),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn checks(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_all_checks_present() {
        let committee = ScoringCommittee::new();
        let feedback = HumanFeedback::new(4, true);
        let result = committee.score(
            &codegen_weights(),
            &checks(&[("tests", 1.0), ("lint", 0.5)]),
            Some(&feedback),
            true,
        );
        // 0.3 * 1.0 + 0.2 * 0.5 + 0.5 * 0.8
        assert!((result.score - 0.8).abs() < 1e-12);
        assert!((result.confidence - 1.0).abs() < 1e-12);
        assert_eq!(result.components.len(), 3);
    }

    #[test]
    fn test_missing_check_weight_is_redistributed() {
        let committee = ScoringCommittee::new();
        let result = committee.score(
            &codegen_weights(),
            &checks(&[("tests", 1.0), ("lint", 0.0)]),
            None,
            true,
        );
        // (0.3 * 1.0 + 0.2 * 0.0) / 0.5
        assert!((result.score - 0.6).abs() < 1e-12);
        assert!((result.confidence - 0.5).abs() < 1e-12);
        assert!(!result.components.contains_key(HUMAN_CHECK));
    }

    #[test]
    fn test_human_only_domain() {
        let committee = ScoringCommittee::new();
        let weights = ScoringWeights::default();
        let feedback = HumanFeedback::new(5, false).with_edits(EditSeverity::Minor);
        let result = committee.score(&weights, &BTreeMap::new(), Some(&feedback), true);
        // 1.0 * 0.5 * 0.9
        assert!((result.score - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_unrated_falls_back_to_success_flag() {
        let committee = ScoringCommittee::new();
        let weights = ScoringWeights::default();
        let ok = committee.score(&weights, &BTreeMap::new(), None, true);
        assert!(ok.flag(UNRATED));
        assert!((ok.score - UNRATED_SUCCESS_SCORE).abs() < 1e-12);
        assert!(ok.confidence < 0.5);

        let failed = committee.score(&weights, &BTreeMap::new(), None, false);
        assert_eq!(failed.score, 0.0);
    }

    #[test]
    fn test_unknown_checks_are_ignored() {
        let committee = ScoringCommittee::new();
        let result = committee.score(
            &codegen_weights(),
            &checks(&[("tests", 0.5), ("coverage", 0.0)]),
            None,
            true,
        );
        assert!((result.score - 0.5).abs() < 1e-12);
        assert!(!result.components.contains_key("coverage"));
    }
}
