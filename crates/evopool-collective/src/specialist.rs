//! Specialists and their performance history.

use crate::happiness::{self, HappinessEvent};
use crate::types::{Domain, SpecialistId, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Slopes within this distance of zero count as flat.
const TREND_EPSILON: f64 = 1e-6;

/// Lifecycle status of a specialist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistStatus {
    /// Recently spawned or restored; not yet eligible for default routing.
    Probation,
    Active,
    Retired,
}

impl SpecialistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistStatus::Probation => "probation",
            SpecialistStatus::Active => "active",
            SpecialistStatus::Retired => "retired",
        }
    }
}

/// Direction of recent scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Declining,
}

/// Kind of an instruction injected into a specialist's configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Avoid,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedInstruction {
    pub kind: InstructionKind,
    pub text: String,
}

/// Snapshot of a specialist's configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistConfig {
    /// Fully composed system instructions (base plus injected blocks)
    pub instructions: String,
    pub temperature: f64,
    pub capabilities: BTreeSet<String>,
    /// Instructions appended to the template when this specialist spawned
    pub injected: Vec<InjectedInstruction>,
}

/// One recorded score, keyed by the task that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSample {
    pub task_id: TaskId,
    pub score: f64,
}

/// Rolling window of recent scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Lifetime number of recorded tasks
    pub task_count: u64,
    pub average: f64,
    pub trend: Trend,
    window_size: usize,
    window: VecDeque<ScoreSample>,
}

impl PerformanceStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            task_count: 0,
            average: 0.0,
            trend: Trend::Stable,
            window_size: window_size.max(1),
            window: VecDeque::new(),
        }
    }

    pub fn record(&mut self, task_id: impl Into<TaskId>, score: f64) {
        self.window.push_back(ScoreSample {
            task_id: task_id.into(),
            score: score.clamp(0.0, 1.0),
        });
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        self.task_count += 1;
        self.recompute();
    }

    /// Replace the score recorded for `task_id`.
    ///
    /// Returns `false` when the sample already left the window.
    pub fn revise(&mut self, task_id: &str, score: f64) -> bool {
        match self.window.iter_mut().find(|s| s.task_id == task_id) {
            Some(sample) => {
                sample.score = score.clamp(0.0, 1.0);
                self.recompute();
                true
            }
            None => false,
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &ScoreSample> {
        self.window.iter()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.window.iter().map(|s| s.score).collect()
    }

    /// Population standard deviation of the window.
    pub fn spread(&self) -> f64 {
        let scores = self.scores();
        if scores.len() < 2 {
            return 0.0;
        }
        variance(&scores).sqrt()
    }

    fn recompute(&mut self) {
        let scores = self.scores();
        self.average = mean(&scores);
        self.trend = trend_of(&scores);
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population variance.
pub(crate) fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Sign of the least-squares slope over the window, oldest first.
fn trend_of(scores: &[f64]) -> Trend {
    let n = scores.len();
    if n < 2 {
        return Trend::Stable;
    }
    let x_mean = (n as f64 - 1.0) / 2.0;
    let y_mean = mean(scores);
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in scores.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    let slope = num / den;
    if slope > TREND_EPSILON {
        Trend::Improving
    } else if slope < -TREND_EPSILON {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// A failed task kept for failure analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub score: f64,
    pub error: Option<String>,
    pub failed_checks: Vec<String>,
    pub tool_errors: Vec<String>,
    pub task_kind: Option<String>,
    pub at: DateTime<Utc>,
}

/// Assignment counter for the overload penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverloadWindow {
    started_at: DateTime<Utc>,
    count: u64,
    penalized: bool,
}

/// A configured worker instance within one domain pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specialist {
    pub id: SpecialistId,
    pub domain: Domain,
    pub generation: u64,
    pub config: SpecialistConfig,
    pub status: SpecialistStatus,
    pub stats: PerformanceStats,
    pub happiness: f64,
    pub recent_failures: VecDeque<FailureRecord>,
    /// Learnings reported with successful tasks
    pub successful_learnings: VecDeque<String>,
    /// Task kinds this specialist has completed successfully
    #[serde(default)]
    pub succeeded_kinds: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    overload: Option<OverloadWindow>,
}

impl Specialist {
    pub fn new(
        domain: impl Into<Domain>,
        generation: u64,
        config: SpecialistConfig,
        status: SpecialistStatus,
        window_size: usize,
        happiness: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            domain: domain.into(),
            generation,
            config,
            status,
            stats: PerformanceStats::new(window_size),
            happiness: happiness.clamp(happiness::MIN_HAPPINESS, happiness::MAX_HAPPINESS),
            recent_failures: VecDeque::new(),
            successful_learnings: VecDeque::new(),
            succeeded_kinds: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            overload: None,
        }
    }

    /// Override the generated identifier (used when restoring from the graveyard).
    pub fn with_id(mut self, id: impl Into<SpecialistId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn average(&self) -> f64 {
        self.stats.average
    }

    pub fn task_count(&self) -> u64 {
        self.stats.task_count
    }

    pub fn is_active(&self) -> bool {
        self.status == SpecialistStatus::Active
    }

    pub fn is_probation(&self) -> bool {
        self.status == SpecialistStatus::Probation
    }

    pub fn record_score(&mut self, task_id: impl Into<TaskId>, score: f64) {
        self.stats.record(task_id, score);
        self.updated_at = Utc::now();
    }

    pub fn apply(&mut self, event: HappinessEvent) {
        self.happiness = happiness::apply(self.happiness, event);
        self.updated_at = Utc::now();
    }

    /// Promote out of probation once enough tasks averaged well enough.
    pub fn promote_if_ready(&mut self, min_tasks: u64, threshold: f64) -> bool {
        if self.is_probation() && self.task_count() >= min_tasks && self.average() >= threshold {
            self.status = SpecialistStatus::Active;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    pub fn record_failure(&mut self, failure: FailureRecord, capacity: usize) {
        self.recent_failures.push_back(failure);
        while self.recent_failures.len() > capacity {
            self.recent_failures.pop_front();
        }
    }

    pub fn record_learnings(&mut self, learnings: &[String], capacity: usize) {
        for learning in learnings {
            let learning = learning.trim();
            if learning.is_empty() || self.successful_learnings.iter().any(|l| l == learning) {
                continue;
            }
            self.successful_learnings.push_back(learning.to_string());
        }
        while self.successful_learnings.len() > capacity {
            self.successful_learnings.pop_front();
        }
    }

    pub fn record_success_kind(&mut self, kind: impl Into<String>) {
        self.succeeded_kinds.insert(kind.into());
    }

    /// Count one assignment.
    ///
    /// Returns `true` exactly once per window, when the assignment count
    /// first exceeds `threshold`.
    pub fn note_assignment(&mut self, now: DateTime<Utc>, window: Duration, threshold: u64) -> bool {
        let expired = self
            .overload
            .as_ref()
            .map(|state| now - state.started_at >= window)
            .unwrap_or(true);
        if expired {
            self.overload = None;
        }
        let state = self.overload.get_or_insert_with(|| OverloadWindow {
            started_at: now,
            count: 0,
            penalized: false,
        });
        state.count += 1;
        if state.count > threshold && !state.penalized {
            state.penalized = true;
            return true;
        }
        false
    }

    pub fn summary(&self) -> SpecialistSummary {
        SpecialistSummary {
            id: self.id.clone(),
            generation: self.generation,
            status: self.status,
            average: self.average(),
            task_count: self.task_count(),
            trend: self.stats.trend,
            happiness: self.happiness,
        }
    }
}

/// Read-only view of a specialist for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistSummary {
    pub id: SpecialistId,
    pub generation: u64,
    pub status: SpecialistStatus,
    pub average: f64,
    pub task_count: u64,
    pub trend: Trend,
    pub happiness: f64,
}

#[cfg(test)]
pub(crate) fn test_config(instructions: &str) -> SpecialistConfig {
    SpecialistConfig {
        instructions: instructions.to_string(),
        temperature: 0.7,
        capabilities: BTreeSet::new(),
        injected: Vec::new(),
    }
}
