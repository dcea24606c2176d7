//! The engine facade: routing, evaluation and evolution wired together.
//!
//! [`Engine`] owns the explicit stores (pools, graveyard, learning books,
//! budget) and the collaborators (executor, voter, persistence). Nothing
//! here is process-global; whoever builds the engine owns its lifecycle.
//!
//! Locks are always taken in the order pool → graveyard → learnings, and a
//! pool lock is never held while waiting on the executor or the council.

use crate::budget::{Admission, BudgetController, BudgetSnapshot, BudgetStore, Usd};
use crate::complexity::{ComplexityRouter, RoutePlan};
use crate::evaluation::{
    committee::ScoringCommittee, comparison::ComparisonSummary, council::CouncilEvaluator,
    CouncilSeat, EvaluationContext, EvaluationController, EvaluationOutcome, EvaluationResult,
};
use crate::evolution::{CycleReport, EvolutionController};
use crate::executor::{CouncilVoter, TaskExecutor};
use crate::graveyard::{Graveyard, GraveyardEntry, LearningBook};
use crate::happiness::{self, HappinessEvent};
use crate::persistence::{EngineSnapshot, JsonFilePersistence, MemoryPersistence, Persistence};
use crate::pool::{DomainPool, DomainStatus, SelectionMode};
use crate::spawner::Spawner;
use crate::specialist::{FailureRecord, Specialist, SpecialistStatus};
use crate::store::PoolStore;
use crate::task::{HumanFeedback, Task, TaskOutput, TaskPriority, TaskRecord, TaskStatus};
use crate::types::{Domain, EngineError, Result, TaskId};
use crate::voting::VoterKind;
use chrono::{DateTime, Utc};
use evopool_config::{
    DomainDocument, DomainRegistry, EngineConfig, EvaluationMode, OverflowBehavior,
    ScoringWeights, HUMAN_CHECK,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};

/// Peers of the executing specialist asked to vote.
const COUNCIL_PEERS: usize = 3;

/// Builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: DomainRegistry,
    executor: Option<Arc<dyn TaskExecutor>>,
    voter: Option<Arc<dyn CouncilVoter>>,
    persistence: Option<Arc<dyn Persistence>>,
    seed: Option<u64>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: DomainRegistry::new(),
            executor: None,
            voter: None,
            persistence: None,
            seed: None,
        }
    }

    pub fn registry(mut self, registry: DomainRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn voter(mut self, voter: Arc<dyn CouncilVoter>) -> Self {
        self.voter = Some(voter);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Seed the selection RNG for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the engine, restoring persisted state if there is any.
    ///
    /// Fails with [`EngineError::CorruptStore`] if the persisted snapshot
    /// cannot be read. Every registered domain without a persisted pool
    /// gets a fresh one.
    pub async fn build(self) -> Result<Arc<Engine>> {
        let executor = self
            .executor
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("no task executor configured")))?;
        let voter = self
            .voter
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("no council voter configured")))?;
        let persistence: Arc<dyn Persistence> = match (self.persistence, &self.config.persistence.snapshot_path) {
            (Some(p), _) => p,
            (None, Some(path)) => Arc::new(JsonFilePersistence::new(path.clone())),
            (None, None) => Arc::new(MemoryPersistence::new()),
        };

        let config = self.config;
        let committee = Arc::new(ScoringCommittee::new());
        let council = Arc::new(CouncilEvaluator::new(voter, config.voting.clone()));
        let evaluation = EvaluationController::new(
            config.evaluation.mode,
            committee,
            council,
            config.voting.comparison_history,
            config.voting.agreement_tolerance,
        );
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let engine = Engine {
            registry: RwLock::new(self.registry),
            pools: PoolStore::new(),
            graveyard: AsyncMutex::new(Graveyard::new()),
            learnings: AsyncMutex::new(HashMap::new()),
            budget: BudgetStore::new(BudgetController::new(&config.budget, Utc::now())),
            router: ComplexityRouter::new(config.complexity.clone()),
            evaluation,
            evolution: EvolutionController::new(config.evolution.clone(), config.pool.clone()),
            spawner: Spawner::from_settings(&config.pool),
            executor,
            persistence,
            tasks: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
            local_capacity: AtomicBool::new(false),
            config,
        };

        engine.restore().await?;
        let documents: Vec<Arc<DomainDocument>> = engine.read_registry().documents().cloned().collect();
        for document in documents {
            if !engine.pools.contains(&document.name) {
                let pool = engine.initial_pool(&document)?;
                engine.pools.insert(pool);
            }
        }
        tracing::info!(
            "Engine ready with {} domains ({} evaluation)",
            engine.pools.len(),
            engine.evaluation.mode().as_str()
        );
        Ok(Arc::new(engine))
    }
}

/// A task that passed admission and is ready to run.
struct Job {
    task: Task,
    specialist: Specialist,
    cancel: watch::Receiver<bool>,
}

enum Prepared {
    Ready(Job),
    Deferred,
}

/// Specialist pool evolution and weighted-council evaluation engine.
pub struct Engine {
    config: EngineConfig,
    registry: RwLock<DomainRegistry>,
    pools: PoolStore,
    graveyard: AsyncMutex<Graveyard>,
    learnings: AsyncMutex<HashMap<Domain, LearningBook>>,
    budget: BudgetStore,
    router: ComplexityRouter,
    evaluation: EvaluationController,
    evolution: EvolutionController,
    spawner: Spawner,
    executor: Arc<dyn TaskExecutor>,
    persistence: Arc<dyn Persistence>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    cancels: Mutex<HashMap<TaskId, watch::Sender<bool>>>,
    deferred: Mutex<Vec<(TaskId, DateTime<Utc>)>>,
    rng: Mutex<StdRng>,
    local_capacity: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, DomainRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn document(&self, domain: &str) -> Option<Arc<DomainDocument>> {
        self.read_registry().get(domain)
    }

    /// Domains with a pool, sorted.
    pub fn domains(&self) -> Vec<Domain> {
        self.pools.domains()
    }

    /// Whether cheaper local capacity is currently available.
    pub fn set_local_capacity(&self, available: bool) {
        self.local_capacity.store(available, Ordering::Relaxed);
    }

    // ========== Domains ==========

    fn initial_pool(&self, document: &DomainDocument) -> Result<DomainPool> {
        let (min_size, max_size) =
            document.pool_bounds(self.config.pool.min_size, self.config.pool.max_size);
        let mut pool = DomainPool::new(document.name.clone(), min_size, max_size);
        for _ in 0..min_size {
            let specialist = self.spawner.spawn(
                &document.name,
                Some(document),
                None,
                1,
                SpecialistStatus::Active,
            )?;
            pool.add(specialist)?;
        }
        tracing::info!(
            "Created pool for {} with {} specialists",
            document.name,
            pool.len()
        );
        Ok(pool)
    }

    /// Add or replace a domain document. A new domain gets a pool of
    /// `min_size` active specialists and is routable immediately.
    pub async fn register_domain(&self, document: DomainDocument) -> Result<DomainStatus> {
        let document = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document)
            .map_err(|e| {
                tracing::warn!("Rejected domain document: {}", e);
                EngineError::from(e)
            })?;

        if let Some(shared) = self.pools.get(&document.name) {
            tracing::info!("Updated domain document for {}", document.name);
            return Ok(shared.lock().await.status());
        }
        let pool = self.initial_pool(&document)?;
        let status = pool.status();
        self.pools.insert(pool);
        Ok(status)
    }

    pub async fn domain_status(&self, domain: &str) -> Result<DomainStatus> {
        let shared = self
            .pools
            .get(domain)
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;
        let status = shared.lock().await.status();
        Ok(status)
    }

    // ========== Tasks ==========

    /// Submit a task; it runs in the background.
    pub async fn submit_task(
        self: &Arc<Self>,
        domain: impl Into<Domain>,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> Result<TaskId> {
        self.submit(Task::new(domain, payload).with_priority(priority))
            .await
    }

    /// Submit a fully specified task; it runs in the background.
    ///
    /// Admission happens before this returns: with the `reject` overflow
    /// behavior an unaffordable task fails here with
    /// [`EngineError::BudgetExceeded`].
    pub async fn submit(self: &Arc<Self>, task: Task) -> Result<TaskId> {
        let task_id = task.id.clone();
        if let Prepared::Ready(job) = self.prepare(task).await? {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.execute(job).await;
            });
        }
        Ok(task_id)
    }

    /// Run a task to completion and return its record.
    pub async fn run_task(&self, task: Task) -> Result<TaskRecord> {
        let task_id = task.id.clone();
        if let Prepared::Ready(job) = self.prepare(task).await? {
            self.execute(job).await;
        }
        self.task(&task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id))
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    fn update_task<F: FnOnce(&mut TaskRecord)>(&self, task_id: &str, f: F) {
        if let Some(record) = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(task_id)
        {
            f(record);
        }
    }

    pub fn retained_tasks(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop finished records older than the retention age, then the oldest
    /// finished ones while more than `max_task_records` remain. Running and
    /// deferred records are never dropped, nor is `keep`.
    fn prune_tasks(&self, keep: &str) {
        let settings = &self.config.pool;
        let cutoff = chrono::Duration::try_seconds(
            i64::try_from(settings.task_retention_secs).unwrap_or(i64::MAX),
        )
        .and_then(|age| Utc::now().checked_sub_signed(age));

        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        if let Some(cutoff) = cutoff {
            tasks.retain(|id, record| {
                id == keep
                    || !record.status.is_terminal()
                    || record.finished_at.map_or(true, |at| at >= cutoff)
            });
        }

        if tasks.len() > settings.max_task_records {
            let mut finished: Vec<(DateTime<Utc>, TaskId)> = tasks
                .iter()
                .filter(|(id, record)| id.as_str() != keep && record.status.is_terminal())
                .map(|(id, record)| (record.finished_at.unwrap_or(record.submitted_at), id.clone()))
                .collect();
            finished.sort();
            let excess = tasks.len() - settings.max_task_records;
            for (_, id) in finished.into_iter().take(excess) {
                tasks.remove(&id);
            }
        }

        let evicted = before - tasks.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} finished task records ({} kept)", evicted, tasks.len());
        }
    }

    /// Route and admit a task, then select its specialist.
    async fn prepare(&self, task: Task) -> Result<Prepared> {
        if self.document(&task.domain).is_none() {
            return Err(EngineError::UnknownDomain(task.domain.clone()));
        }
        let plan = self
            .router
            .route(&task, self.local_capacity.load(Ordering::Relaxed));
        let (plan, admission) = match self.admit(&task, plan).await? {
            Ok(admitted) => admitted,
            Err(until) => {
                self.defer(task, until);
                return Ok(Prepared::Deferred);
            }
        };

        let specialist = match self.select_specialist(&task, plan.selection).await {
            Ok(specialist) => specialist,
            Err(e) => {
                self.budget.refund(&admission).await;
                return Err(e);
            }
        };

        self.note_assignment(&task.domain, &specialist.id).await;
        tracing::info!(
            "Task {} routed to {} in {} ({}, {} tier, {})",
            task.id,
            specialist.id,
            task.domain,
            plan.selection.as_str(),
            plan.cost_tier.as_str(),
            admission.cost
        );

        let (sender, cancel) = watch::channel(false);
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), sender);
        let record = TaskRecord {
            task: task.clone(),
            status: TaskStatus::Running {
                specialist_id: specialist.id.clone(),
            },
            complexity: plan.complexity,
            cost_tier: plan.cost_tier,
            cost: admission.cost,
            specialist_id: Some(specialist.id.clone()),
            output: None,
            evaluation: None,
            feedback: None,
            submitted_at: Utc::now(),
            finished_at: None,
        };
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), record);

        Ok(Prepared::Ready(Job {
            task,
            specialist,
            cancel,
        }))
    }

    /// Admit the plan's cost, applying the overflow behavior on refusal.
    ///
    /// `Ok(Err(until))` means the task should wait for a budget reset.
    async fn admit(
        &self,
        task: &Task,
        plan: RoutePlan,
    ) -> Result<std::result::Result<(RoutePlan, Admission), DateTime<Utc>>> {
        let err = match self.budget.try_admit(plan.estimated_cost, task.category).await {
            Ok(admission) => return Ok(Ok((plan, admission))),
            Err(err @ EngineError::BudgetExceeded { .. }) => err,
            Err(other) => return Err(other),
        };

        match self.budget.overflow().await {
            OverflowBehavior::Reject => {
                tracing::warn!("Rejected task {}: {}", task.id, err);
                Err(err)
            }
            OverflowBehavior::Queue => {
                if self
                    .budget
                    .exceeds_limit(plan.estimated_cost, task.category)
                    .await
                {
                    tracing::warn!(
                        "Rejected task {}: {} does not fit any {} window",
                        task.id,
                        plan.estimated_cost,
                        task.category
                    );
                    return Err(err);
                }
                let until = match &err {
                    EngineError::BudgetExceeded { resets_at, .. } => *resets_at,
                    _ => self.budget.earliest_reset(task.category).await,
                };
                tracing::info!("Deferring task {} until {}: {}", task.id, until, err);
                Ok(Err(until))
            }
            OverflowBehavior::Downgrade => {
                let mut current = plan;
                while let Some(cheaper) = self.router.downgrade(&current) {
                    match self.budget.try_admit(cheaper.estimated_cost, task.category).await {
                        Ok(admission) => {
                            tracing::info!(
                                "Downgraded task {} from {} to {} tier",
                                task.id,
                                current.cost_tier.as_str(),
                                cheaper.cost_tier.as_str()
                            );
                            return Ok(Ok((cheaper, admission)));
                        }
                        Err(EngineError::BudgetExceeded { .. }) => current = cheaper,
                        Err(other) => return Err(other),
                    }
                }
                tracing::warn!("No affordable tier for task {}: {}", task.id, err);
                Err(err)
            }
        }
    }

    fn defer(&self, task: Task, until: DateTime<Utc>) {
        let task_id = task.id.clone();
        let complexity = self.router.classify(&task);
        let record = TaskRecord {
            status: TaskStatus::Deferred { until },
            complexity,
            cost_tier: self
                .router
                .cost_tier(complexity, self.local_capacity.load(Ordering::Relaxed)),
            cost: Usd::ZERO,
            specialist_id: None,
            output: None,
            evaluation: None,
            feedback: None,
            submitted_at: Utc::now(),
            finished_at: None,
            task,
        };
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.clone(), record);
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((task_id, until));
    }

    /// Resubmit deferred tasks whose budget window has reset.
    pub async fn process_deferred(self: &Arc<Self>) -> Vec<TaskId> {
        self.process_deferred_at(Utc::now()).await
    }

    pub async fn process_deferred_at(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<TaskId> {
        let due: Vec<TaskId> = {
            let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
            let (due, waiting): (Vec<_>, Vec<_>) =
                deferred.drain(..).partition(|(_, until)| *until <= now);
            *deferred = waiting;
            due.into_iter().map(|(id, _)| id).collect()
        };

        let mut resubmitted = Vec::new();
        for task_id in due {
            let Some(record) = self.task(&task_id) else {
                continue;
            };
            match self.submit(record.task).await {
                Ok(id) => resubmitted.push(id),
                Err(e) => {
                    tracing::warn!("Deferred task {} failed on resubmission: {}", task_id, e);
                    self.update_task(&task_id, |r| {
                        r.status = TaskStatus::Failed {
                            reason: e.to_string(),
                        };
                        r.finished_at = Some(Utc::now());
                    });
                    self.prune_tasks(&task_id);
                }
            }
        }
        resubmitted
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Pick the specialist for a task, bootstrapping the pool if needed.
    async fn select_specialist(&self, task: &Task, mode: SelectionMode) -> Result<Specialist> {
        let shared = self
            .pools
            .get(&task.domain)
            .ok_or_else(|| EngineError::UnknownDomain(task.domain.clone()))?;
        let mut pool = shared.lock().await;

        if let Some(pinned) = &task.pinned_specialist {
            return pool
                .get(pinned)
                .cloned()
                .ok_or_else(|| EngineError::SpecialistNotFound(pinned.clone()));
        }

        let selected = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            pool.select(mode, &mut *rng)
        };
        match selected {
            Err(EngineError::PoolExhausted { .. }) => self.bootstrap(&mut pool).await,
            other => other,
        }
    }

    /// Recover from an exhausted pool: grow it with an active specialist
    /// if there is room, otherwise fall back to the best probation one.
    async fn bootstrap(&self, pool: &mut DomainPool) -> Result<Specialist> {
        if !pool.is_full() {
            let document = self.document(&pool.domain);
            let learnings = self.learnings.lock().await;
            let spawned = self.spawner.spawn(
                &pool.domain,
                document.as_deref(),
                learnings.get(&pool.domain),
                pool.next_generation(),
                SpecialistStatus::Active,
            );
            drop(learnings);
            match spawned {
                Ok(specialist) => {
                    tracing::warn!(
                        "Pool {} exhausted; bootstrapped specialist {}",
                        pool.domain,
                        specialist.id
                    );
                    pool.add(specialist.clone())?;
                    return Ok(specialist);
                }
                Err(e) => tracing::error!("Bootstrap spawn for {} failed: {}", pool.domain, e),
            }
        }
        match pool.best_probation() {
            Some(specialist) => {
                tracing::info!(
                    "No active specialist in {}; routing to probation specialist {}",
                    pool.domain,
                    specialist.id
                );
                Ok(specialist.clone())
            }
            None => Err(pool.exhausted()),
        }
    }

    async fn note_assignment(&self, domain: &str, specialist_id: &str) {
        let Some(shared) = self.pools.get(domain) else {
            return;
        };
        let window = chrono::Duration::seconds(
            i64::try_from(self.config.pool.overload_window_secs).unwrap_or(i64::MAX / 1000),
        );
        let mut pool = shared.lock().await;
        if let Some(specialist) = pool.get_mut(specialist_id) {
            if specialist.note_assignment(Utc::now(), window, self.config.pool.overload_threshold) {
                specialist.apply(HappinessEvent::WorkOverload);
                tracing::warn!(
                    "Specialist {} overloaded ({} assignments in window)",
                    specialist_id,
                    self.config.pool.overload_threshold + 1
                );
            }
        }
    }

    /// Run the task, then evaluate and record it unless cancelled.
    async fn execute(&self, job: Job) {
        let Job {
            task,
            specialist,
            cancel,
        } = job;

        let result = tokio::select! {
            result = self.executor.execute(&specialist, &task) => Some(result),
            _ = cancelled(cancel) => None,
        };
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task.id);

        let output = match result {
            None => {
                tracing::info!("Task {} cancelled; no score recorded", task.id);
                self.update_task(&task.id, |r| {
                    r.status = TaskStatus::Cancelled;
                    r.finished_at = Some(Utc::now());
                });
                self.prune_tasks(&task.id);
                return;
            }
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                tracing::warn!("Task {} failed in {}: {}", task.id, specialist.id, e);
                TaskOutput::failure(e.to_string())
            }
        };

        let evaluation = self.evaluate(&task, &specialist, &output).await;
        let trigger = self.record(&task, &specialist.id, &output, &evaluation).await;

        let result = evaluation.result;
        self.update_task(&task.id, |r| {
            r.status = if output.succeeded {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed {
                    reason: output
                        .error
                        .clone()
                        .unwrap_or_else(|| "task reported failure".to_string()),
                }
            };
            r.output = Some(output);
            r.evaluation = Some(result);
            r.finished_at = Some(Utc::now());
        });
        self.prune_tasks(&task.id);

        if trigger {
            tracing::info!("Task threshold reached for {}; running evolution", task.domain);
            if let Err(e) = self.trigger_evolution_cycle(&task.domain).await {
                tracing::error!("Evolution cycle for {} failed: {}", task.domain, e);
            }
        }
    }

    /// Council: the top active peers of the executing specialist plus the
    /// top specialist of the administration domain.
    async fn council_seats(&self, domain: &str, executor_id: &str) -> (Vec<CouncilSeat>, u64) {
        let mut seats = Vec::new();
        let mut generation = 1;
        if let Some(shared) = self.pools.get(domain) {
            let pool = shared.lock().await;
            generation = pool.generation;
            seats.extend(
                pool.active()
                    .filter(|s| s.id != executor_id)
                    .take(COUNCIL_PEERS)
                    .map(|s| CouncilSeat {
                        specialist: s.clone(),
                        kind: VoterKind::Specialist,
                    }),
            );
        }

        let admin_domain = &self.config.evaluation.admin_domain;
        if let Some(shared) = self.pools.get(admin_domain) {
            let pool = shared.lock().await;
            let admin = pool
                .active()
                .find(|s| s.id != executor_id && !seats.iter().any(|seat| seat.specialist.id == s.id));
            if let Some(admin) = admin {
                seats.push(CouncilSeat {
                    specialist: admin.clone(),
                    kind: VoterKind::Admin,
                });
            }
        }
        (seats, generation)
    }

    fn weights(&self, domain: &str) -> ScoringWeights {
        self.document(domain)
            .map(|d| d.scoring.clone())
            .unwrap_or_default()
    }

    async fn evaluate(
        &self,
        task: &Task,
        specialist: &Specialist,
        output: &TaskOutput,
    ) -> EvaluationOutcome {
        let (seats, pool_generation) = self.council_seats(&task.domain, &specialist.id).await;
        let weights = self.weights(&task.domain);
        let ctx = EvaluationContext {
            task,
            output,
            weights: &weights,
            feedback: None,
            pool_generation,
            seats: &seats,
        };
        match self.evaluation.evaluate(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Evaluation of task {} failed: {}; using committee", task.id, e);
                self.evaluation
                    .committee()
                    .score(&weights, &output.checks, None, output.succeeded)
                    .into()
            }
        }
    }

    /// Record score, happiness and failure history. Returns whether the
    /// domain reached its evolution threshold.
    async fn record(
        &self,
        task: &Task,
        specialist_id: &str,
        output: &TaskOutput,
        evaluation: &EvaluationOutcome,
    ) -> bool {
        let Some(shared) = self.pools.get(&task.domain) else {
            return false;
        };
        let settings = &self.config;
        let score = evaluation.result.score;
        let event = happiness::task_event(output.succeeded, score, settings.evolution.cull_threshold);

        let trigger = {
            let mut pool = shared.lock().await;
            match pool.record_score(
                specialist_id,
                task.id.clone(),
                score,
                settings.pool.probation_tasks,
                settings.pool.probation_threshold,
            ) {
                Ok(update) => tracing::debug!(
                    "Recorded {:.3} for {} (average {:.3}, {:?})",
                    score,
                    specialist_id,
                    update.average,
                    update.trend
                ),
                Err(e) => tracing::debug!("Score for task {} not recorded: {}", task.id, e),
            }

            if let Some(specialist) = pool.get_mut(specialist_id) {
                specialist.apply(event);
                if event == HappinessEvent::TaskSuccess {
                    specialist.record_learnings(&output.learnings, settings.pool.failure_history);
                    if let Some(kind) = &task.kind {
                        specialist.record_success_kind(kind.clone());
                    }
                } else {
                    specialist.record_failure(
                        FailureRecord {
                            task_id: task.id.clone(),
                            score,
                            error: output.error.clone(),
                            failed_checks: output.failed_checks(),
                            tool_errors: output.tool_errors.clone(),
                            task_kind: task.kind.clone(),
                            at: Utc::now(),
                        },
                        settings.pool.failure_history,
                    );
                }
                tracing::debug!(
                    "Happiness event {} for {} (now {:.0})",
                    event.as_str(),
                    specialist_id,
                    specialist.happiness
                );
            }

            if let Some(round) = &evaluation.round {
                for id in &round.winners {
                    pool.apply_happiness(id, HappinessEvent::VoteWon);
                }
                for id in &round.rejected {
                    pool.apply_happiness(id, HappinessEvent::VoteIgnored);
                }
            }

            pool.completed_since_cycle += 1;
            !pool.evolution_paused
                && settings.evolution.tasks_per_cycle > 0
                && pool.completed_since_cycle >= settings.evolution.tasks_per_cycle
        };

        // Admin voters live in another pool.
        let admin_domain = &settings.evaluation.admin_domain;
        if let (Some(round), true) = (&evaluation.round, admin_domain != &task.domain) {
            if let Some(admin) = self.pools.get(admin_domain) {
                let mut pool = admin.lock().await;
                for id in &round.winners {
                    pool.apply_happiness(id, HappinessEvent::VoteWon);
                }
                for id in &round.rejected {
                    pool.apply_happiness(id, HappinessEvent::VoteIgnored);
                }
            }
        }
        trigger
    }

    /// Cancel a running or deferred task. Returns `false` if it already
    /// finished.
    pub fn cancel_task(&self, task_id: &str) -> Result<bool> {
        if let Some(sender) = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
        {
            let _ = sender.send(true);
            tracing::info!("Cancellation requested for task {}", task_id);
            return Ok(true);
        }

        let was_deferred = {
            let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
            let before = deferred.len();
            deferred.retain(|(id, _)| id != task_id);
            deferred.len() != before
        };
        if was_deferred {
            self.update_task(task_id, |r| {
                r.status = TaskStatus::Cancelled;
                r.finished_at = Some(Utc::now());
            });
            self.prune_tasks(task_id);
            return Ok(true);
        }

        match self.task(task_id) {
            Some(_) => Ok(false),
            None => Err(EngineError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Re-score a finished task with human feedback.
    ///
    /// The committee recomputes the score with the feedback included, and
    /// the specialist's sample for this task is revised in place if it is
    /// still in the window. A domain that does not weight human feedback
    /// gives it as much weight as all its checks together.
    pub async fn submit_human_feedback(
        &self,
        task_id: &str,
        feedback: HumanFeedback,
    ) -> Result<EvaluationResult> {
        let record = self
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let (Some(output), Some(specialist_id)) = (&record.output, &record.specialist_id) else {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "task {} has no result to rate",
                task_id
            )));
        };

        let weights = feedback_weights(&self.weights(&record.task.domain));
        let result = self.evaluation.committee().score(
            &weights,
            &output.checks,
            Some(&feedback),
            output.succeeded,
        );

        if let Some(shared) = self.pools.get(&record.task.domain) {
            let mut pool = shared.lock().await;
            match pool.revise_score(specialist_id, task_id, result.score) {
                Ok(true) => tracing::info!(
                    "Revised score of task {} to {:.3} from human feedback",
                    task_id,
                    result.score
                ),
                Ok(false) => tracing::debug!("Task {} already left the score window", task_id),
                Err(e) => tracing::debug!("Feedback for task {} not applied: {}", task_id, e),
            }
            if feedback.bonus && pool.apply_happiness(specialist_id, HappinessEvent::BonusReceived) {
                tracing::info!("Bonus granted to {}", specialist_id);
            }
        }

        let revised = result.clone();
        self.update_task(task_id, |r| {
            r.feedback = Some(feedback);
            r.evaluation = Some(revised);
        });
        Ok(result)
    }

    // ========== Evaluation mode ==========

    pub fn set_evaluation_mode(&self, mode: EvaluationMode) {
        self.evaluation.set_mode(mode);
    }

    pub fn evaluation_mode(&self) -> EvaluationMode {
        self.evaluation.mode()
    }

    /// Committee vs council agreement collected in `both` mode.
    pub fn comparison(&self) -> ComparisonSummary {
        self.evaluation.comparison()
    }

    // ========== Budget ==========

    pub async fn budget_status(&self) -> BudgetSnapshot {
        self.budget.snapshot().await
    }

    // ========== Evolution ==========

    /// Run one evolution cycle for `domain` now.
    ///
    /// Waits at most the configured cycle timeout for the domain lock.
    pub async fn trigger_evolution_cycle(&self, domain: &str) -> Result<CycleReport> {
        let shared = self
            .pools
            .get(domain)
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;
        let timeout = Duration::from_millis(self.config.evolution.cycle_timeout_ms);

        let report = {
            let mut pool = tokio::time::timeout(timeout, shared.lock())
                .await
                .map_err(|_| {
                    EngineError::Timeout(format!("evolution cycle for {} is still running", domain))
                })?;
            pool.completed_since_cycle = 0;
            let document = self.document(domain);
            let mut graveyard = self.graveyard.lock().await;
            let mut learnings = self.learnings.lock().await;
            let book = learnings
                .entry(domain.to_string())
                .or_insert_with(|| LearningBook::new(domain));
            self.evolution
                .run_cycle(&mut pool, document.as_deref(), &mut graveyard, book)?
        };

        if report.skipped.is_none() {
            if let Err(e) = self.save_snapshot().await {
                tracing::error!("Failed to save snapshot after cycle: {}", e);
            }
        }
        Ok(report)
    }

    /// Clear a convergence (or manual) pause.
    pub async fn resume_evolution(&self, domain: &str) -> Result<()> {
        let shared = self
            .pools
            .get(domain)
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;
        let mut pool = shared.lock().await;
        if pool.evolution_paused {
            pool.resume();
            tracing::info!("Evolution resumed for {}", domain);
        }
        Ok(())
    }

    pub async fn pause_evolution(&self, domain: &str, reason: impl Into<String>) -> Result<()> {
        let shared = self
            .pools
            .get(domain)
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_string()))?;
        let reason = reason.into();
        tracing::info!("Evolution paused for {}: {}", domain, reason);
        shared.lock().await.pause(reason, Utc::now());
        Ok(())
    }

    // ========== Graveyard ==========

    pub async fn list_graveyard(&self, domain: Option<&str>) -> Vec<GraveyardEntry> {
        self.graveyard.lock().await.list(domain)
    }

    /// Bring a retired specialist back on probation with its archived
    /// configuration and a fresh generation.
    pub async fn restore_from_graveyard(&self, specialist_id: &str) -> Result<Specialist> {
        let entry = self
            .graveyard
            .lock()
            .await
            .find(specialist_id)
            .cloned()
            .ok_or_else(|| EngineError::SpecialistNotFound(specialist_id.to_string()))?;
        let shared = self
            .pools
            .get(&entry.domain)
            .ok_or_else(|| EngineError::UnknownDomain(entry.domain.clone()))?;

        let mut pool = shared.lock().await;
        if pool.contains(specialist_id) {
            return Err(EngineError::AlreadyActive(specialist_id.to_string()));
        }
        if pool.is_full() {
            return Err(EngineError::PoolAtCapacity {
                domain: pool.domain.clone(),
                max_size: pool.max_size,
            });
        }
        let specialist = self.spawner.restore(&entry, pool.next_generation());
        pool.add(specialist.clone())?;
        tracing::info!(
            "Restored {} to {} on probation (generation {})",
            specialist.id,
            pool.domain,
            specialist.generation
        );
        Ok(specialist)
    }

    // ========== Persistence ==========

    pub async fn snapshot(&self) -> EngineSnapshot {
        let pools = self.pools.snapshot().await;
        let graveyard = self.graveyard.lock().await.clone();
        let mut learnings: Vec<LearningBook> =
            self.learnings.lock().await.values().cloned().collect();
        learnings.sort_by(|a, b| a.domain.cmp(&b.domain));
        let budget = self.budget.ledger().await;
        EngineSnapshot::new(pools, graveyard, learnings, budget)
    }

    /// Save the current state. The write runs on the blocking pool.
    pub async fn save_snapshot(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        let pools = snapshot.pools.len();
        let persistence = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || persistence.save(&snapshot))
            .await
            .map_err(|e| EngineError::Persistence(format!("snapshot writer: {}", e)))??;
        tracing::debug!("Saved snapshot with {} pools", pools);
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        let persistence = Arc::clone(&self.persistence);
        let loaded = tokio::task::spawn_blocking(move || persistence.load())
            .await
            .map_err(|e| EngineError::Persistence(format!("snapshot reader: {}", e)))??;
        let Some(snapshot) = loaded else {
            return Ok(());
        };
        tracing::info!(
            "Restoring {} pools and {} archived specialists from snapshot of {}",
            snapshot.pools.len(),
            snapshot.graveyard.len(),
            snapshot.saved_at
        );
        for pool in snapshot.pools {
            self.pools.insert(pool);
        }
        *self.graveyard.lock().await = snapshot.graveyard;
        *self.learnings.lock().await = snapshot
            .learnings
            .into_iter()
            .map(|book| (book.domain.clone(), book))
            .collect();
        self.budget.restore_ledger(&snapshot.budget).await;
        Ok(())
    }
}

/// Resolves once the flag is set; never resolves if the sender is gone.
async fn cancelled(mut flag: watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn feedback_weights(weights: &ScoringWeights) -> ScoringWeights {
    if weights.weights.contains_key(HUMAN_CHECK) {
        return weights.clone();
    }
    let mut weights = weights.clone();
    let total: f64 = weights.weights.values().sum();
    weights
        .weights
        .insert(HUMAN_CHECK.to_string(), if total > 0.0 { total } else { 1.0 });
    weights
}
