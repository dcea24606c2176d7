//! Evolution cycles: cull, archive, learn, respawn.

use crate::convergence::{ConvergenceDetector, ConvergenceReport};
use crate::graveyard::{
    FailureAnalyzer, Graveyard, GraveyardEntry, Learning, LearningBook, LearningKind,
};
use crate::happiness::HappinessEvent;
use crate::pool::DomainPool;
use crate::spawner::Spawner;
use crate::specialist::{Specialist, SpecialistStatus};
use crate::types::{Domain, Result, SpecialistId};
use chrono::Utc;
use evopool_config::{DomainDocument, EvolutionSettings, PoolSettings};
use serde::{Deserialize, Serialize};

/// A specialist removed during a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CulledSpecialist {
    pub id: SpecialistId,
    pub average: f64,
    pub happiness: f64,
    pub reason: String,
}

/// What one evolution cycle did to a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub domain: Domain,
    /// Pool generation after the cycle
    pub generation: u64,
    pub culled: Option<CulledSpecialist>,
    pub spawned: Option<SpecialistId>,
    pub learnings_added: usize,
    pub convergence: Option<ConvergenceReport>,
    /// Set when the cycle did not run
    pub skipped: Option<String>,
}

impl CycleReport {
    fn skipped(pool: &DomainPool, reason: impl Into<String>) -> Self {
        Self {
            domain: pool.domain.clone(),
            generation: pool.generation,
            culled: None,
            spawned: None,
            learnings_added: 0,
            convergence: None,
            skipped: Some(reason.into()),
        }
    }

    pub fn paused(&self) -> bool {
        self.convergence
            .as_ref()
            .map(|c| c.converged)
            .unwrap_or(false)
    }
}

/// Runs evolution cycles against one pool at a time.
///
/// The caller holds the pool's lock for the whole cycle, which gives
/// per-domain mutual exclusion.
#[derive(Debug, Clone)]
pub struct EvolutionController {
    settings: EvolutionSettings,
    pool_settings: PoolSettings,
    analyzer: FailureAnalyzer,
    spawner: Spawner,
    convergence: ConvergenceDetector,
}

impl EvolutionController {
    pub fn new(settings: EvolutionSettings, pool_settings: PoolSettings) -> Self {
        Self {
            analyzer: FailureAnalyzer::new(),
            spawner: Spawner::from_settings(&pool_settings),
            convergence: ConvergenceDetector::from_settings(&settings),
            settings,
            pool_settings,
        }
    }

    pub fn settings(&self) -> &EvolutionSettings {
        &self.settings
    }

    pub fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    /// Run one cycle.
    ///
    /// If the replacement cannot be spawned the cycle is rolled back: the
    /// underperformer stays, nothing is archived, and
    /// [`EngineError::SpawnFailed`](crate::types::EngineError::SpawnFailed)
    /// is returned.
    pub fn run_cycle(
        &self,
        pool: &mut DomainPool,
        document: Option<&DomainDocument>,
        graveyard: &mut Graveyard,
        book: &mut LearningBook,
    ) -> Result<CycleReport> {
        if pool.evolution_paused {
            tracing::debug!("Evolution paused for {}, skipping cycle", pool.domain);
            return Ok(CycleReport::skipped(
                pool,
                pool.pause_reason.clone().unwrap_or_else(|| "paused".to_string()),
            ));
        }

        let mut report = CycleReport::skipped(pool, "");
        report.skipped = None;

        if let Some((victim_id, reason)) = self.select_underperformer(pool) {
            let victim = pool
                .get(&victim_id)
                .cloned()
                .ok_or_else(|| crate::types::EngineError::SpecialistNotFound(victim_id.clone()))?;
            let analysis = self.analyzer.analyze(&victim);

            let mut next_book = book.clone();
            let mut added = 0;
            for pattern in analysis.patterns() {
                let mut learning = Learning::avoidance(pattern, Some(victim.id.clone()));
                learning.evidence = analysis.evidence.get(&pattern).cloned().unwrap_or_default();
                if next_book.add(learning) {
                    added += 1;
                }
            }
            for mate in pool.specialists() {
                if mate.id == victim.id || mate.average() < self.settings.enhancement_threshold {
                    continue;
                }
                for text in &mate.successful_learnings {
                    if next_book.add(Learning::enhancement(text.clone(), Some(mate.id.clone()))) {
                        added += 1;
                    }
                }
            }

            let replacement = match self.spawner.spawn(
                &pool.domain,
                document,
                Some(&next_book),
                pool.next_generation(),
                SpecialistStatus::Probation,
            ) {
                Ok(replacement) => replacement,
                Err(e) => {
                    tracing::error!(
                        "Cull of {} in {} rolled back, replacement failed: {}",
                        victim.id,
                        pool.domain,
                        e
                    );
                    return Err(e);
                }
            };

            let retired = pool.retire(&victim.id).unwrap_or(victim);
            graveyard.append(GraveyardEntry::from_specialist(&retired, &analysis, &reason));
            pool.apply_happiness_all(HappinessEvent::PoolMateRetired);
            report.spawned = Some(replacement.id.clone());
            pool.add(replacement)?;
            *book = next_book;

            tracing::info!(
                "Culled {} from {} ({}); {} new learnings ({} avoidance total)",
                retired.id,
                pool.domain,
                reason,
                added,
                book.of_kind(LearningKind::Avoidance).count()
            );
            report.learnings_added = added;
            report.culled = Some(CulledSpecialist {
                id: retired.id,
                average: retired.stats.average,
                happiness: retired.happiness,
                reason,
            });
        }

        pool.rerank();
        pool.generation += 1;
        pool.completed_since_cycle = 0;
        pool.best_score_history.push(pool.best_score());
        self.convergence.compact_history(&mut pool.best_score_history);

        let convergence = self
            .convergence
            .check(&pool.top_scores(3), &pool.best_score_history);
        if convergence.converged {
            tracing::info!("Pausing evolution for {}: {}", pool.domain, convergence.reason);
            pool.pause(convergence.reason.clone(), Utc::now());
        }

        report.generation = pool.generation;
        report.convergence = Some(convergence);
        Ok(report)
    }

    /// The single specialist to cull this cycle, with the reason.
    ///
    /// Specialists without a recorded task, and probation specialists
    /// without enough evidence, are never candidates.
    /// The lowest average below the cull threshold goes first, ties going to
    /// the less happy one; if nobody is below the threshold the lowest-ranked
    /// candidate goes, but only while the pool is above its minimum size.
    pub fn select_underperformer(&self, pool: &DomainPool) -> Option<(SpecialistId, String)> {
        let candidates: Vec<&Specialist> = pool
            .specialists()
            .iter()
            .filter(|s| s.task_count() > 0)
            .filter(|s| !(s.is_probation() && s.task_count() < self.pool_settings.probation_tasks))
            .collect();

        let below = candidates
            .iter()
            .filter(|s| s.average() < self.settings.cull_threshold)
            .min_by(|a, b| {
                a.average()
                    .total_cmp(&b.average())
                    .then_with(|| a.happiness.total_cmp(&b.happiness))
            });
        if let Some(s) = below {
            return Some((
                s.id.clone(),
                format!(
                    "average {:.3} below threshold {}",
                    s.average(),
                    self.settings.cull_threshold
                ),
            ));
        }

        if pool.len() > pool.min_size {
            return candidates.last().map(|s| {
                (
                    s.id.clone(),
                    format!("lowest ranked (average {:.3})", s.average()),
                )
            });
        }
        None
    }
}
