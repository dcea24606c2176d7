//! Convergence detection.

use crate::specialist::variance;
use evopool_config::EvolutionSettings;
use serde::{Deserialize, Serialize};

/// Number of top specialists whose spread is checked.
const TOP_N: usize = 3;

/// Outcome of a convergence check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergenceReport {
    pub converged: bool,
    pub top_variance: f64,
    pub best_score: f64,
    pub generations_without_improvement: usize,
    /// Human-readable explanation, used as the pause reason
    pub reason: String,
}

/// Decides whether a pool has stopped benefiting from evolution.
///
/// A pool is converged when its top three agree closely, its best score
/// has not improved for a number of generations, and that best score is
/// already high.
#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    max_variance: f64,
    patience: usize,
    min_best: f64,
    min_improvement: f64,
}

impl ConvergenceDetector {
    pub fn new(max_variance: f64, patience: usize, min_best: f64, min_improvement: f64) -> Self {
        Self {
            max_variance,
            patience,
            min_best,
            min_improvement,
        }
    }

    pub fn from_settings(settings: &EvolutionSettings) -> Self {
        Self::new(
            settings.convergence_max_variance,
            settings.convergence_patience,
            settings.convergence_min_best,
            settings.min_improvement,
        )
    }

    /// Shorten `best_history` to `patience + 1` entries by folding the
    /// oldest ones into the best they reached. Whether the pool has stalled
    /// for `patience` generations is unchanged.
    pub fn compact_history(&self, best_history: &mut Vec<f64>) {
        let keep = self.patience + 1;
        if best_history.len() <= keep {
            return;
        }
        let excess = best_history.len() - keep;
        let Some((head, _)) = scan_history(&best_history[..=excess], self.min_improvement) else {
            return;
        };
        best_history.drain(..excess);
        best_history[0] = head;
    }

    /// `ranked_scores` are window averages in rank order; `best_history`
    /// holds the pool's best score at the end of each generation, oldest first.
    pub fn check(&self, ranked_scores: &[f64], best_history: &[f64]) -> ConvergenceReport {
        let top: Vec<f64> = ranked_scores.iter().take(TOP_N).copied().collect();
        let top_variance = variance(&top);
        let best_score = top.first().copied().unwrap_or(0.0);
        let stale = generations_without_improvement(best_history, self.min_improvement);

        let tight = top.len() >= TOP_N && top_variance < self.max_variance;
        let stalled = stale >= self.patience;
        let high = best_score > self.min_best;
        let converged = tight && stalled && high;

        let reason = if converged {
            format!(
                "converged: top-{} variance {:.4} < {}, no improvement for {} generations, best {:.3} > {}",
                TOP_N, top_variance, self.max_variance, stale, best_score, self.min_best
            )
        } else {
            let mut missing = Vec::new();
            if !tight {
                missing.push(format!("top-{} variance {:.4}", TOP_N, top_variance));
            }
            if !stalled {
                missing.push(format!("{} stale generations", stale));
            }
            if !high {
                missing.push(format!("best {:.3}", best_score));
            }
            format!("not converged: {}", missing.join(", "))
        };

        ConvergenceReport {
            converged,
            top_variance,
            best_score,
            generations_without_improvement: stale,
            reason,
        }
    }
}

/// Generations since the best score last rose by more than `min_improvement`.
fn generations_without_improvement(history: &[f64], min_improvement: f64) -> usize {
    scan_history(history, min_improvement).map_or(0, |(_, stale)| stale)
}

/// The last best that counted as an improvement, and the generations since.
fn scan_history(history: &[f64], min_improvement: f64) -> Option<(f64, usize)> {
    let (first, rest) = history.split_first()?;
    let mut best = *first;
    let mut stale = 0;
    for score in rest {
        if *score > best + min_improvement {
            best = *score;
            stale = 0;
        } else {
            stale += 1;
        }
    }
    Some((best, stale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ConvergenceDetector {
        ConvergenceDetector::from_settings(&EvolutionSettings::default())
    }

    #[test]
    fn test_converged_when_all_conditions_hold() {
        let history = vec![0.90; 11];
        let report = detector().check(&[0.90, 0.78, 0.66], &history);
        assert!(report.top_variance < 0.02);
        assert_eq!(report.generations_without_improvement, 10);
        assert!(report.converged, "{}", report.reason);
    }

    #[test]
    fn test_low_best_score_blocks_convergence() {
        let history = vec![0.80; 11];
        let report = detector().check(&[0.80, 0.68, 0.56], &history);
        assert!(report.top_variance < 0.02);
        assert!(!report.converged);
        assert!(report.reason.contains("best"));
    }

    #[test]
    fn test_recent_improvement_blocks_convergence() {
        let mut history = vec![0.86; 10];
        history.push(0.90);
        let report = detector().check(&[0.90, 0.89, 0.88], &history);
        assert_eq!(report.generations_without_improvement, 0);
        assert!(!report.converged);
    }

    #[test]
    fn test_wide_spread_blocks_convergence() {
        let history = vec![0.95; 12];
        let report = detector().check(&[0.95, 0.6, 0.3], &history);
        assert!(!report.converged);
    }

    #[test]
    fn test_tiny_gains_count_as_stale() {
        let history: Vec<f64> = (0..11).map(|i| 0.9 + i as f64 * 0.00005).collect();
        assert_eq!(generations_without_improvement(&history, 0.001), 10);
    }

    #[test]
    fn test_compacted_history_keeps_stall() {
        // An early peak nothing has beaten since
        let mut history = vec![0.95];
        history.extend([0.80; 15]);
        history.extend([0.90; 5]);
        let detector = detector();
        let full = detector.check(&[0.95, 0.94, 0.93], &history);
        assert!(full.converged, "{}", full.reason);

        detector.compact_history(&mut history);
        assert_eq!(history.len(), 11);
        assert_eq!(history[0], 0.95);
        let compacted = detector.check(&[0.95, 0.94, 0.93], &history);
        assert!(compacted.converged, "{}", compacted.reason);
        assert_eq!(compacted.generations_without_improvement, 10);

        let mut short = vec![0.5, 0.6];
        detector.compact_history(&mut short);
        assert_eq!(short, vec![0.5, 0.6]);
    }

    #[test]
    fn test_compacted_history_keeps_recent_gain() {
        let mut history = vec![0.70; 20];
        history.push(0.90);
        let detector = detector();
        detector.compact_history(&mut history);
        assert_eq!(history.len(), 11);
        assert_eq!(generations_without_improvement(&history, 0.001), 0);
    }
}
