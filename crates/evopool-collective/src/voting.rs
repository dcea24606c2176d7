//! Weighted council voting.
//!
//! Each vote is weighted by the voter's performance coefficient times its
//! happiness multiplier. Before aggregation, votes that sit far from the
//! rest of the council are rejected as outliers.

use crate::happiness;
use crate::types::{EngineError, Result, SpecialistId};
use chrono::{DateTime, Utc};
use evopool_config::VotingSettings;
use serde::{Deserialize, Serialize};

/// Distance below which two votes count as equally close to the consensus.
const WINNER_EPSILON: f64 = 1e-9;

/// Where a voter comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VoterKind {
    /// Top specialist of the task's own domain.
    Specialist,
    /// Top specialist of the administration domain.
    Admin,
}

/// A single scored opinion on a task result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub voter_id: SpecialistId,
    pub kind: VoterKind,
    pub score: f64,
    pub rationale: Option<String>,
    pub cast_at: DateTime<Utc>,
}

/// A vote together with the voter state that determines its weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Ballot {
    pub vote: Vote,
    pub voter_average: f64,
    pub voter_happiness: f64,
}

/// A vote that survived outlier rejection, with its final weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedVote {
    pub voter_id: SpecialistId,
    pub kind: VoterKind,
    pub score: f64,
    pub weight: f64,
}

/// Result of one council round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundOutcome {
    /// Weighted mean of the surviving votes
    pub score: f64,
    pub survivors: Vec<WeightedVote>,
    /// Voters whose votes were rejected as outliers
    pub rejected: Vec<SpecialistId>,
    /// Surviving voters closest to the consensus
    pub winners: Vec<SpecialistId>,
    /// Population variance of the surviving (unweighted) scores
    pub variance: f64,
}

impl RoundOutcome {
    pub fn min_score(&self) -> f64 {
        self.survivors
            .iter()
            .map(|v| v.score)
            .fold(f64::INFINITY, f64::min)
    }
}

/// Computes vote weights and aggregates council rounds.
#[derive(Debug, Clone)]
pub struct VoteAggregator {
    settings: VotingSettings,
}

impl VoteAggregator {
    pub fn new(settings: VotingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &VotingSettings {
        &self.settings
    }

    /// Piecewise-linear coefficient of a voter's window average.
    ///
    /// `min_coefficient` at or below `floor_score`, 1.0 at `pivot_score`,
    /// `max_coefficient` at or above `ceiling_score`.
    pub fn performance_coefficient(&self, average: f64) -> f64 {
        let s = &self.settings;
        if average <= s.floor_score {
            s.min_coefficient
        } else if average <= s.pivot_score {
            let t = (average - s.floor_score) / (s.pivot_score - s.floor_score);
            s.min_coefficient + t * (1.0 - s.min_coefficient)
        } else if average < s.ceiling_score {
            let t = (average - s.pivot_score) / (s.ceiling_score - s.pivot_score);
            1.0 + t * (s.max_coefficient - 1.0)
        } else {
            s.max_coefficient
        }
    }

    pub fn weight(&self, average: f64, happiness: f64) -> f64 {
        self.performance_coefficient(average) * happiness::voting_multiplier(happiness)
    }

    /// Aggregate a round of ballots.
    ///
    /// Each vote is compared with the mean and spread of the *other* votes;
    /// a vote further than `outlier_sigma` spreads away is rejected, as long
    /// as at least `min_survivors` votes remain. Fails with
    /// [`EngineError::InsufficientVotes`] when fewer than `min_votes` remain.
    pub fn aggregate(&self, ballots: &[Ballot]) -> Result<RoundOutcome> {
        let s = &self.settings;
        if ballots.len() < s.min_votes {
            return Err(EngineError::InsufficientVotes {
                required: s.min_votes,
                received: ballots.len(),
            });
        }

        let scores: Vec<f64> = ballots.iter().map(|b| b.vote.score).collect();
        let outliers = self.outliers(&scores);
        let keep_outliers = ballots.len() - outliers.len() < s.min_survivors;

        let mut survivors = Vec::new();
        let mut rejected = Vec::new();
        for (i, ballot) in ballots.iter().enumerate() {
            if outliers.contains(&i) && !keep_outliers {
                tracing::debug!(
                    "Rejecting outlier vote {:.3} from {}",
                    ballot.vote.score,
                    ballot.vote.voter_id
                );
                rejected.push(ballot.vote.voter_id.clone());
                continue;
            }
            survivors.push(WeightedVote {
                voter_id: ballot.vote.voter_id.clone(),
                kind: ballot.vote.kind,
                score: ballot.vote.score,
                weight: self.weight(ballot.voter_average, ballot.voter_happiness),
            });
        }

        if survivors.len() < s.min_votes {
            return Err(EngineError::InsufficientVotes {
                required: s.min_votes,
                received: survivors.len(),
            });
        }

        let total_weight: f64 = survivors.iter().map(|v| v.weight).sum();
        let score = if total_weight > 0.0 {
            survivors.iter().map(|v| v.score * v.weight).sum::<f64>() / total_weight
        } else {
            survivors.iter().map(|v| v.score).sum::<f64>() / survivors.len() as f64
        };

        let closest = survivors
            .iter()
            .map(|v| (v.score - score).abs())
            .fold(f64::INFINITY, f64::min);
        let winners = survivors
            .iter()
            .filter(|v| (v.score - score).abs() <= closest + WINNER_EPSILON)
            .map(|v| v.voter_id.clone())
            .collect();

        let surviving_scores: Vec<f64> = survivors.iter().map(|v| v.score).collect();
        Ok(RoundOutcome {
            score: score.clamp(0.0, 1.0),
            variance: crate::specialist::variance(&surviving_scores),
            survivors,
            rejected,
            winners,
        })
    }

    /// Indices of votes that deviate from the others by more than the limit.
    fn outliers(&self, scores: &[f64]) -> Vec<usize> {
        let s = &self.settings;
        if scores.len() <= s.min_survivors {
            return Vec::new();
        }
        (0..scores.len())
            .filter(|&i| {
                let others: Vec<f64> = scores
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, v)| *v)
                    .collect();
                let mean = crate::specialist::mean(&others);
                let spread = crate::specialist::variance(&others).sqrt().max(s.min_spread);
                (scores[i] - mean).abs() > s.outlier_sigma * spread
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> VoteAggregator {
        VoteAggregator::new(VotingSettings::default())
    }

    fn ballot(id: &str, score: f64, average: f64, happiness: f64) -> Ballot {
        Ballot {
            vote: Vote {
                voter_id: id.to_string(),
                kind: VoterKind::Specialist,
                score,
                rationale: None,
                cast_at: Utc::now(),
            },
            voter_average: average,
            voter_happiness: happiness,
        }
    }

    #[test]
    fn test_coefficient_knots() {
        let agg = aggregator();
        assert!((agg.performance_coefficient(0.0) - 0.5).abs() < 1e-12);
        assert!((agg.performance_coefficient(0.2) - 0.5).abs() < 1e-12);
        assert!((agg.performance_coefficient(0.5) - 0.75).abs() < 1e-12);
        assert!((agg.performance_coefficient(0.8) - 1.0).abs() < 1e-12);
        assert!((agg.performance_coefficient(0.95) - 2.0).abs() < 1e-12);
        assert!((agg.performance_coefficient(1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_coefficient_is_monotone() {
        let agg = aggregator();
        let mut last = 0.0;
        for i in 0..=100 {
            let c = agg.performance_coefficient(i as f64 / 100.0);
            assert!(c >= last);
            last = c;
        }
    }

    #[test]
    fn test_weight_examples() {
        let agg = aggregator();
        assert!((agg.weight(0.95, 100.0) - 2.0).abs() < 1e-9);
        assert!((agg.weight(0.5, 0.0) - 0.525).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_rejected() {
        let agg = aggregator();
        let ballots = vec![
            ballot("a", 0.9, 0.8, 60.0),
            ballot("b", 0.92, 0.8, 60.0),
            ballot("c", 0.1, 0.8, 60.0),
            ballot("d", 0.88, 0.8, 60.0),
        ];
        let outcome = agg.aggregate(&ballots).unwrap();
        assert_eq!(outcome.rejected, vec!["c".to_string()]);
        assert_eq!(outcome.survivors.len(), 3);
        assert!((outcome.score - 0.9).abs() < 1e-9);
        assert!(outcome.winners.contains(&"a".to_string()));
    }

    #[test]
    fn test_two_votes_never_rejected() {
        let agg = aggregator();
        let ballots = vec![ballot("a", 0.95, 0.8, 60.0), ballot("b", 0.05, 0.8, 60.0)];
        let outcome = agg.aggregate(&ballots).unwrap();
        assert!(outcome.rejected.is_empty());
        assert!((outcome.score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_three_votes_keep_survivor_floor() {
        let agg = aggregator();
        let ballots = vec![
            ballot("a", 0.9, 0.8, 60.0),
            ballot("b", 0.9, 0.8, 60.0),
            ballot("c", 0.1, 0.8, 60.0),
        ];
        let outcome = agg.aggregate(&ballots).unwrap();
        assert!(outcome.rejected.is_empty());
        assert_eq!(outcome.survivors.len(), 3);
    }

    #[test]
    fn test_single_vote_is_insufficient() {
        let agg = aggregator();
        let err = agg.aggregate(&[ballot("a", 0.9, 0.8, 60.0)]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientVotes {
                required: 2,
                received: 1
            }
        ));
    }

    #[test]
    fn test_heavier_voter_pulls_consensus() {
        let agg = aggregator();
        let ballots = vec![ballot("strong", 1.0, 0.95, 100.0), ballot("weak", 0.0, 0.2, 0.0)];
        let outcome = agg.aggregate(&ballots).unwrap();
        // 2.0 vs 0.35
        let expected = 2.0 / 2.35;
        assert!((outcome.score - expected).abs() < 1e-9);
        assert_eq!(outcome.winners, vec!["strong".to_string()]);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let agg = aggregator();
        let ballots = vec![
            ballot("a", 1.0, 1.0, 100.0),
            ballot("b", 1.0, 0.0, 0.0),
            ballot("c", 0.0, 0.5, 50.0),
        ];
        let outcome = agg.aggregate(&ballots).unwrap();
        assert!((0.0..=1.0).contains(&outcome.score));
    }
}
