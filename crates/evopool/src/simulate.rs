//! Seeded simulation of task traffic.
//!
//! Every specialist gets a hidden skill the first time it runs a task.
//! Specialists spawned with injected learnings start slightly stronger, so
//! a pool that keeps culling and respawning should drift upwards over a
//! long run.

use async_trait::async_trait;
use evopool_collective::{
    BudgetCategory, CouncilVoter, Domain, Engine, EngineError, HumanFeedback, Specialist,
    SpecialistId, Task, TaskExecutor, TaskOutput, TaskPriority, TaskStatus, VoteDraft,
};
use evopool_config::{DomainRegistry, HUMAN_CHECK};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const NOISE: f64 = 0.1;
const FAILURE_BELOW: f64 = 0.4;
const INSTRUCTION_BONUS: f64 = 0.03;
const MAX_BONUS: f64 = 0.15;
const FEEDBACK_RATE: f64 = 0.5;
const BENCHMARK_RATE: f64 = 0.2;

const FAILURE_MODES: &[&str] = &[
    "empty input not handled",
    "tool call rejected: invalid arguments",
    "answer contradicts the previous result",
    "ignored instructions about the output format",
];

const LEARNINGS: &[&str] = &[
    "Restate the acceptance criteria before answering",
    "Check inputs for empty and boundary values first",
    "Cite the source for every factual claim",
];

fn quality_of(output: &TaskOutput) -> Option<f64> {
    output.content.get("quality").and_then(|q| q.as_f64())
}

/// Executor with a hidden, seeded skill per specialist.
pub struct SimulatedExecutor {
    checks: HashMap<Domain, Vec<String>>,
    skills: Mutex<HashMap<SpecialistId, f64>>,
    rng: Mutex<StdRng>,
}

impl SimulatedExecutor {
    pub fn new(registry: &DomainRegistry, seed: u64) -> Self {
        let checks = registry
            .documents()
            .map(|doc| {
                let names = doc
                    .scoring
                    .weights
                    .keys()
                    .filter(|name| name.as_str() != HUMAN_CHECK)
                    .cloned()
                    .collect();
                (doc.name.clone(), names)
            })
            .collect();
        Self {
            checks,
            skills: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Hidden skill of a specialist, drawn on first use.
    pub fn skill(&self, specialist: &Specialist) -> f64 {
        let mut skills = self.skills.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(skill) = skills.get(&specialist.id) {
            return *skill;
        }
        let base = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0.35..0.9);
        let bonus = (specialist.config.injected.len() as f64 * INSTRUCTION_BONUS).min(MAX_BONUS);
        let skill = (base + bonus).min(0.98);
        skills.insert(specialist.id.clone(), skill);
        skill
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, specialist: &Specialist, task: &Task) -> anyhow::Result<TaskOutput> {
        let skill = self.skill(specialist);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let quality = (skill + rng.gen_range(-NOISE..NOISE)).clamp(0.0, 1.0);

        let mut output = if quality < FAILURE_BELOW {
            let mode = FAILURE_MODES[rng.gen_range(0..FAILURE_MODES.len())];
            let mut output = TaskOutput::failure(mode);
            output.content = json!({ "quality": quality });
            output
        } else {
            let mut output = TaskOutput::success(json!({ "quality": quality }));
            if quality > 0.8 {
                output = output.with_learning(LEARNINGS[rng.gen_range(0..LEARNINGS.len())]);
            }
            output
        };

        if let Some(checks) = self.checks.get(&task.domain) {
            for check in checks {
                let value = (quality + rng.gen_range(-NOISE / 2.0..NOISE / 2.0)).clamp(0.0, 1.0);
                output = output.with_check(check.clone(), value);
            }
        }
        Ok(output)
    }
}

/// Voter that scores the hidden quality with some noise.
pub struct SimulatedVoter {
    rng: Mutex<StdRng>,
}

impl SimulatedVoter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed.wrapping_add(1))),
        }
    }
}

#[async_trait]
impl CouncilVoter for SimulatedVoter {
    async fn vote(
        &self,
        _voter: &Specialist,
        _task: &Task,
        output: &TaskOutput,
    ) -> anyhow::Result<VoteDraft> {
        let base = quality_of(output).unwrap_or(0.0);
        let noise = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(-NOISE..NOISE);
        Ok(VoteDraft::new((base + noise).clamp(0.0, 1.0)))
    }
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub tasks: usize,
    pub seed: u64,
}

/// Outcome counts of a simulation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSummary {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub errors: usize,
    pub feedback: usize,
}

fn priority(rng: &mut StdRng) -> TaskPriority {
    match rng.gen_range(0..100) {
        0..=29 => TaskPriority::Low,
        30..=79 => TaskPriority::Normal,
        80..=94 => TaskPriority::High,
        _ => TaskPriority::Critical,
    }
}

/// Drive `options.tasks` tasks through the engine, one at a time.
///
/// Task traffic goes to every domain except the administration domain,
/// unless that is the only one. Domains scored by humans receive simulated
/// feedback for about half of their completed tasks.
pub async fn run(
    engine: &Arc<Engine>,
    registry: &DomainRegistry,
    options: &SimulationOptions,
) -> anyhow::Result<SimulationSummary> {
    let admin = &engine.config().evaluation.admin_domain;
    let mut domains: Vec<Domain> = engine.domains().into_iter().filter(|d| d != admin).collect();
    if domains.is_empty() {
        domains = engine.domains();
    }
    if domains.is_empty() {
        anyhow::bail!("no domains to simulate");
    }

    let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(2));
    let mut summary = SimulationSummary::default();

    for i in 0..options.tasks {
        let domain = domains[rng.gen_range(0..domains.len())].clone();
        let text = "x".repeat(rng.gen_range(20..600));
        let mut task = Task::new(domain.clone(), json!({ "request": i, "text": text }))
            .with_priority(priority(&mut rng));
        if rng.gen_bool(BENCHMARK_RATE) {
            task = task.with_category(BudgetCategory::Benchmark);
        }
        summary.submitted += 1;

        let record = match engine.run_task(task).await {
            Ok(record) => record,
            Err(e @ EngineError::BudgetExceeded { .. }) => {
                tracing::debug!("Task {} rejected: {}", i, e);
                summary.rejected += 1;
                continue;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Task {} in {} failed: {}", i, domain, e);
                summary.errors += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match &record.status {
            TaskStatus::Completed => summary.completed += 1,
            TaskStatus::Failed { .. } => summary.failed += 1,
            TaskStatus::Deferred { .. } => {
                summary.deferred += 1;
                continue;
            }
            TaskStatus::Running { .. } | TaskStatus::Cancelled => continue,
        }

        let human_scored = registry
            .get(&domain)
            .map(|doc| doc.scoring.weights.contains_key(HUMAN_CHECK))
            .unwrap_or(false);
        if human_scored && rng.gen_bool(FEEDBACK_RATE) {
            let quality = record.output.as_ref().and_then(quality_of).unwrap_or(0.0);
            let rating = (1.0 + quality * 4.0).round() as u8;
            let worked = record.status == TaskStatus::Completed;
            match engine
                .submit_human_feedback(&record.task.id, HumanFeedback::new(rating, worked))
                .await
            {
                Ok(_) => summary.feedback += 1,
                Err(e) => tracing::warn!("Feedback for task {} not applied: {}", record.task.id, e),
            }
        }
    }

    tracing::info!(
        "Simulated {} tasks: {} completed, {} failed, {} deferred, {} rejected",
        summary.submitted,
        summary.completed,
        summary.failed,
        summary.deferred,
        summary.rejected
    );
    Ok(summary)
}
