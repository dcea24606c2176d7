//! Domain pools: ranking and selection of specialists.
//!
//! A pool keeps its specialists sorted by window average (descending, ties
//! broken by fewer recorded tasks first) and picks one per task according
//! to a [`SelectionMode`].

use crate::happiness::HappinessEvent;
use crate::specialist::{Specialist, SpecialistStatus, SpecialistSummary, Trend};
use crate::types::{Domain, EngineError, Result, SpecialistId, TaskId};
use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Relative weights of the top three specialists in weighted selection.
const WEIGHTED_SHARES: [f64; 3] = [0.6, 0.3, 0.1];

/// Number of specialists rotated through in round-robin mode.
const ROUND_ROBIN_WIDTH: usize = 3;

/// How a specialist is picked for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Always the top-ranked active specialist.
    Best,
    /// 60/30/10 draw across the top three active specialists.
    Weighted,
    /// Rotate through the top three, probation included.
    RoundRobin,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Best => "best",
            SelectionMode::Weighted => "weighted",
            SelectionMode::RoundRobin => "round_robin",
        }
    }
}

/// Result of recording a score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub average: f64,
    pub trend: Trend,
    pub promoted: bool,
}

/// Ordered collection of specialists serving one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainPool {
    pub domain: Domain,
    pub min_size: usize,
    pub max_size: usize,
    /// Incremented by every executed evolution cycle
    pub generation: u64,
    pub evolution_paused: bool,
    pub pause_reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Best window average recorded at the end of each cycle
    pub best_score_history: Vec<f64>,
    /// Tasks completed since the last evolution cycle
    pub completed_since_cycle: u64,
    specialists: Vec<Specialist>,
    round_robin_cursor: usize,
}

impl DomainPool {
    pub fn new(domain: impl Into<Domain>, min_size: usize, max_size: usize) -> Self {
        Self {
            domain: domain.into(),
            min_size,
            max_size,
            generation: 1,
            evolution_paused: false,
            pause_reason: None,
            paused_at: None,
            best_score_history: Vec::new(),
            completed_since_cycle: 0,
            specialists: Vec::new(),
            round_robin_cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.specialists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specialists.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.specialists.len() >= self.max_size
    }

    /// Specialists in rank order.
    pub fn specialists(&self) -> &[Specialist] {
        &self.specialists
    }

    pub fn get(&self, id: &str) -> Option<&Specialist> {
        self.specialists.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Specialist> {
        self.specialists.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn active(&self) -> impl Iterator<Item = &Specialist> {
        self.specialists.iter().filter(|s| s.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Top `n` active specialists in rank order.
    pub fn top_active(&self, n: usize) -> Vec<&Specialist> {
        self.active().take(n).collect()
    }

    /// Generation assigned to the next specialist added to this pool.
    pub fn next_generation(&self) -> u64 {
        self.specialists
            .iter()
            .map(|s| s.generation)
            .max()
            .unwrap_or(0)
            .max(self.generation)
            + 1
    }

    /// Add a specialist, failing when the pool is full.
    pub fn add(&mut self, specialist: Specialist) -> Result<()> {
        if self.is_full() {
            return Err(EngineError::PoolAtCapacity {
                domain: self.domain.clone(),
                max_size: self.max_size,
            });
        }
        tracing::debug!(
            "Adding specialist {} (generation {}, {}) to {}",
            specialist.id,
            specialist.generation,
            specialist.status.as_str(),
            self.domain
        );
        self.specialists.push(specialist);
        self.rerank();
        Ok(())
    }

    /// Remove a specialist and mark it retired.
    pub fn retire(&mut self, id: &str) -> Option<Specialist> {
        let index = self.specialists.iter().position(|s| s.id == id)?;
        let mut specialist = self.specialists.remove(index);
        specialist.status = SpecialistStatus::Retired;
        specialist.updated_at = Utc::now();
        Some(specialist)
    }

    /// Sort by average descending, ties by task count ascending.
    pub fn rerank(&mut self) {
        self.specialists.sort_by(compare_rank);
    }

    /// Pick a specialist for the next task.
    ///
    /// `Best` and `Weighted` only consider active specialists. Returns
    /// [`EngineError::PoolExhausted`] when nothing is eligible.
    pub fn select<R: Rng + ?Sized>(&mut self, mode: SelectionMode, rng: &mut R) -> Result<Specialist> {
        match mode {
            SelectionMode::Best => self
                .active()
                .next()
                .cloned()
                .ok_or_else(|| self.exhausted()),
            SelectionMode::Weighted => {
                let top = self.top_active(WEIGHTED_SHARES.len());
                if top.is_empty() {
                    return Err(self.exhausted());
                }
                let shares = &WEIGHTED_SHARES[..top.len()];
                let dist = WeightedIndex::new(shares).map_err(|e| {
                    EngineError::Internal(anyhow::anyhow!("invalid selection weights: {}", e))
                })?;
                Ok(top[dist.sample(rng)].clone())
            }
            SelectionMode::RoundRobin => {
                let candidates: Vec<&Specialist> = self
                    .specialists
                    .iter()
                    .filter(|s| s.status != SpecialistStatus::Retired)
                    .take(ROUND_ROBIN_WIDTH)
                    .collect();
                if candidates.is_empty() {
                    return Err(self.exhausted());
                }
                let chosen = candidates[self.round_robin_cursor % candidates.len()].clone();
                self.round_robin_cursor = self.round_robin_cursor.wrapping_add(1);
                Ok(chosen)
            }
        }
    }

    /// Best probation specialist, used when no active one is eligible.
    pub fn best_probation(&self) -> Option<&Specialist> {
        self.specialists.iter().find(|s| s.is_probation())
    }

    pub fn exhausted(&self) -> EngineError {
        EngineError::PoolExhausted {
            domain: self.domain.clone(),
            pool_size: self.specialists.len(),
            min_size: self.min_size,
            eligible: self.active_count(),
        }
    }

    /// Record a task score, promote if ready, and rerank.
    pub fn record_score(
        &mut self,
        specialist_id: &str,
        task_id: impl Into<TaskId>,
        score: f64,
        probation_tasks: u64,
        probation_threshold: f64,
    ) -> Result<ScoreUpdate> {
        let specialist = self
            .get_mut(specialist_id)
            .ok_or_else(|| EngineError::SpecialistNotFound(specialist_id.to_string()))?;
        specialist.record_score(task_id, score);
        let promoted = specialist.promote_if_ready(probation_tasks, probation_threshold);
        if promoted {
            tracing::info!("Specialist {} promoted out of probation", specialist.id);
        }
        let update = ScoreUpdate {
            average: specialist.average(),
            trend: specialist.stats.trend,
            promoted,
        };
        self.rerank();
        Ok(update)
    }

    /// Revise a previously recorded score; `Ok(false)` if it left the window.
    pub fn revise_score(&mut self, specialist_id: &str, task_id: &str, score: f64) -> Result<bool> {
        let specialist = self
            .get_mut(specialist_id)
            .ok_or_else(|| EngineError::SpecialistNotFound(specialist_id.to_string()))?;
        let revised = specialist.stats.revise(task_id, score);
        if revised {
            self.rerank();
        }
        Ok(revised)
    }

    pub fn apply_happiness(&mut self, specialist_id: &str, event: HappinessEvent) -> bool {
        match self.get_mut(specialist_id) {
            Some(specialist) => {
                specialist.apply(event);
                true
            }
            None => false,
        }
    }

    pub fn apply_happiness_all(&mut self, event: HappinessEvent) {
        for specialist in &mut self.specialists {
            specialist.apply(event);
        }
    }

    pub fn best_score(&self) -> f64 {
        self.specialists.first().map(|s| s.average()).unwrap_or(0.0)
    }

    /// Mean window average over all specialists.
    pub fn average_score(&self) -> f64 {
        if self.specialists.is_empty() {
            return 0.0;
        }
        self.specialists.iter().map(|s| s.average()).sum::<f64>() / self.specialists.len() as f64
    }

    /// Window averages of the top `n` specialists.
    pub fn top_scores(&self, n: usize) -> Vec<f64> {
        self.specialists.iter().take(n).map(|s| s.average()).collect()
    }

    pub fn pause(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.evolution_paused = true;
        self.pause_reason = Some(reason.into());
        self.paused_at = Some(now);
    }

    pub fn resume(&mut self) {
        self.evolution_paused = false;
        self.pause_reason = None;
        self.paused_at = None;
        // A resumed pool starts a fresh improvement history.
        self.best_score_history.clear();
    }

    pub fn status(&self) -> DomainStatus {
        DomainStatus {
            domain: self.domain.clone(),
            generation: self.generation,
            pool_size: self.specialists.len(),
            min_size: self.min_size,
            max_size: self.max_size,
            best_score: self.best_score(),
            average_score: self.average_score(),
            evolution_paused: self.evolution_paused,
            pause_reason: self.pause_reason.clone(),
            specialists: self.specialists.iter().map(Specialist::summary).collect(),
        }
    }
}

fn compare_rank(a: &Specialist, b: &Specialist) -> Ordering {
    b.average()
        .total_cmp(&a.average())
        .then_with(|| a.task_count().cmp(&b.task_count()))
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainStatus {
    pub domain: Domain,
    pub generation: u64,
    pub pool_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub best_score: f64,
    pub average_score: f64,
    pub evolution_paused: bool,
    pub pause_reason: Option<String>,
    pub specialists: Vec<SpecialistSummary>,
}

impl DomainStatus {
    pub fn specialist_ids(&self) -> Vec<SpecialistId> {
        self.specialists.iter().map(|s| s.id.clone()).collect()
    }
}

#[cfg(test)]
pub(crate) fn scored_specialist(
    domain: &str,
    status: SpecialistStatus,
    scores: &[f64],
) -> Specialist {
    let mut s = Specialist::new(
        domain,
        1,
        crate::specialist::test_config("Do the work."),
        status,
        20,
        60.0,
    );
    for (i, score) in scores.iter().enumerate() {
        s.record_score(format!("seed-{}", i), *score);
    }
    s
}
