//! Periodic evolution trigger.

use crate::engine::Engine;
use crate::types::EngineError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Runs an evolution cycle for every domain on a fixed interval, and
/// resubmits deferred tasks whose budget window has reset.
pub struct EvolutionScheduler {
    engine: Arc<Engine>,
    interval: Duration,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Evolution scheduler stopped abnormally: {}", e);
        }
    }
}

impl EvolutionScheduler {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Use the engine's configured interval.
    pub fn from_engine(engine: Arc<Engine>) -> Self {
        let interval = Duration::from_secs(engine.config().evolution.interval_secs.max(1));
        Self::new(engine, interval)
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(
                "Starting evolution scheduler with interval {} seconds",
                self.interval.as_secs()
            );
            let mut interval = time::interval(self.interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            info!("Evolution scheduler stopped");
                            return;
                        }
                    }
                }
            }
        });
        SchedulerHandle { shutdown, task }
    }

    /// One pass over every domain. Cycles of different domains run
    /// concurrently.
    pub async fn tick(&self) {
        let resubmitted = self.engine.process_deferred().await;
        if !resubmitted.is_empty() {
            info!("Resubmitted {} deferred tasks", resubmitted.len());
        }

        let domains = self.engine.domains();
        debug!("Scheduled evolution for {} domains", domains.len());
        let cycles = domains.iter().map(|domain| async move {
            (domain, self.engine.trigger_evolution_cycle(domain).await)
        });
        for (domain, result) in futures::future::join_all(cycles).await {
            match result {
                Ok(report) if report.skipped.is_some() => {
                    debug!("Skipped evolution for {}", domain)
                }
                Ok(report) => debug!(
                    "Evolution for {} finished at generation {}",
                    domain, report.generation
                ),
                Err(EngineError::SpawnFailed { reason, .. }) => {
                    warn!("Evolution for {} rolled back: {}", domain, reason)
                }
                Err(e) => error!("Evolution for {} failed: {}", domain, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CouncilVoter, TaskExecutor, VoteDraft};
    use crate::specialist::Specialist;
    use crate::task::{Task, TaskOutput};
    use async_trait::async_trait;
    use evopool_config::{DomainDocument, DomainRegistry, EngineConfig};

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        async fn execute(&self, _s: &Specialist, _t: &Task) -> anyhow::Result<TaskOutput> {
            Ok(TaskOutput::success(serde_json::Value::Null))
        }
    }

    #[async_trait]
    impl CouncilVoter for Noop {
        async fn vote(&self, _v: &Specialist, _t: &Task, _o: &TaskOutput) -> anyhow::Result<VoteDraft> {
            Ok(VoteDraft::new(0.5))
        }
    }

    async fn engine() -> Arc<Engine> {
        let mut registry = DomainRegistry::new();
        registry
            .insert(DomainDocument::new("support", "Help users."))
            .unwrap();
        registry
            .insert(DomainDocument::new("billing", "Explain invoices."))
            .unwrap();
        Engine::builder(EngineConfig::default())
            .registry(registry)
            .executor(Arc::new(Noop))
            .voter(Arc::new(Noop))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_advances_every_domain() {
        let engine = engine().await;
        EvolutionScheduler::new(engine.clone(), Duration::from_secs(60))
            .tick()
            .await;
        for domain in ["billing", "support"] {
            assert_eq!(engine.domain_status(domain).await.unwrap().generation, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_and_shutdown() {
        let engine = engine().await;
        let handle = EvolutionScheduler::new(engine.clone(), Duration::from_secs(60)).start();

        time::sleep(Duration::from_secs(150)).await;
        let generation = engine.domain_status("support").await.unwrap().generation;
        assert_eq!(generation, 3);

        handle.shutdown().await;
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(engine.domain_status("support").await.unwrap().generation, 3);
    }
}
