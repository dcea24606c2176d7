//! Specialist happiness.
//!
//! Happiness is a bounded scalar in `[0, 100]` that moves in response to
//! discrete events and feeds into council vote weights. Everything here is
//! a pure function of the current value and the event; the pool owns the
//! state.

use serde::{Deserialize, Serialize};

pub const MIN_HAPPINESS: f64 = 0.0;
pub const MAX_HAPPINESS: f64 = 100.0;
pub const DEFAULT_HAPPINESS: f64 = 60.0;

/// Events that move a specialist's happiness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HappinessEvent {
    TaskSuccess,
    TaskFailure,
    BonusReceived,
    /// The specialist's vote was among those closest to the consensus.
    VoteWon,
    /// The specialist's vote was rejected as an outlier.
    VoteIgnored,
    PoolMateRetired,
    WorkOverload,
}

impl HappinessEvent {
    pub fn delta(&self) -> f64 {
        match self {
            HappinessEvent::TaskSuccess => 5.0,
            HappinessEvent::TaskFailure => -8.0,
            HappinessEvent::BonusReceived => 15.0,
            HappinessEvent::VoteWon => 3.0,
            HappinessEvent::VoteIgnored => -5.0,
            HappinessEvent::PoolMateRetired => -8.0,
            HappinessEvent::WorkOverload => -12.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HappinessEvent::TaskSuccess => "task_success",
            HappinessEvent::TaskFailure => "task_failure",
            HappinessEvent::BonusReceived => "bonus_received",
            HappinessEvent::VoteWon => "vote_won",
            HappinessEvent::VoteIgnored => "vote_ignored",
            HappinessEvent::PoolMateRetired => "pool_mate_retired",
            HappinessEvent::WorkOverload => "work_overload",
        }
    }
}

/// Apply one event, clamping to `[0, 100]`.
pub fn apply(current: f64, event: HappinessEvent) -> f64 {
    (current + event.delta()).clamp(MIN_HAPPINESS, MAX_HAPPINESS)
}

/// Vote weight multiplier: 0.7 at happiness 0, 1.0 at happiness 100.
pub fn voting_multiplier(happiness: f64) -> f64 {
    let h = happiness.clamp(MIN_HAPPINESS, MAX_HAPPINESS);
    0.7 + 0.3 * (h / MAX_HAPPINESS)
}

/// Event produced by a finished task.
///
/// A task counts as a success when the executor reported success and the
/// evaluated score reached `success_threshold`.
pub fn task_event(succeeded: bool, score: f64, success_threshold: f64) -> HappinessEvent {
    if succeeded && score >= success_threshold {
        HappinessEvent::TaskSuccess
    } else {
        HappinessEvent::TaskFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_at_bounds() {
        assert_eq!(apply(98.0, HappinessEvent::BonusReceived), 100.0);
        assert_eq!(apply(4.0, HappinessEvent::WorkOverload), 0.0);
        assert_eq!(apply(0.0, HappinessEvent::TaskFailure), 0.0);
    }

    #[test]
    fn test_event_sequence_stays_in_range() {
        let events = [
            HappinessEvent::TaskFailure,
            HappinessEvent::WorkOverload,
            HappinessEvent::PoolMateRetired,
            HappinessEvent::BonusReceived,
            HappinessEvent::BonusReceived,
            HappinessEvent::BonusReceived,
            HappinessEvent::VoteWon,
            HappinessEvent::VoteIgnored,
        ];
        let mut h = DEFAULT_HAPPINESS;
        for _ in 0..20 {
            for event in events {
                h = apply(h, event);
                assert!((MIN_HAPPINESS..=MAX_HAPPINESS).contains(&h));
            }
        }
    }

    #[test]
    fn test_voting_multiplier_range() {
        assert!((voting_multiplier(0.0) - 0.7).abs() < 1e-12);
        assert!((voting_multiplier(100.0) - 1.0).abs() < 1e-12);
        assert!((voting_multiplier(50.0) - 0.85).abs() < 1e-12);
        assert!((voting_multiplier(250.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_task_event() {
        assert_eq!(task_event(true, 0.9, 0.6), HappinessEvent::TaskSuccess);
        assert_eq!(task_event(true, 0.4, 0.6), HappinessEvent::TaskFailure);
        assert_eq!(task_event(false, 0.9, 0.6), HappinessEvent::TaskFailure);
    }
}
