use async_trait::async_trait;
use evopool_collective::{
    BudgetCategory, BudgetWindow, CouncilVoter, Engine, EngineError, EvaluatorKind,
    JsonFilePersistence, Specialist, SpecialistStatus, Task, TaskExecutor, TaskOutput,
    TaskStatus, Usd, VoteDraft,
};
use evopool_config::{DomainDocument, DomainRegistry, EngineConfig, EvaluationMode};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Quality per specialist id; unknown specialists produce 0.8.
#[derive(Default)]
struct ScriptedExecutor {
    quality: Mutex<HashMap<String, f64>>,
}

impl ScriptedExecutor {
    fn set(&self, id: &str, quality: f64) {
        self.quality.lock().unwrap().insert(id.to_string(), quality);
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, specialist: &Specialist, _task: &Task) -> anyhow::Result<TaskOutput> {
        let quality = self
            .quality
            .lock()
            .unwrap()
            .get(&specialist.id)
            .copied()
            .unwrap_or(0.8);
        if quality < 0.5 {
            return Ok(TaskOutput::failure("empty input not handled").with_check("tests", quality));
        }
        Ok(TaskOutput::success(json!({"answer": "done"}))
            .with_check("tests", quality)
            .with_learning("Quote the relevant policy section"))
    }
}

struct ConstantVoter(f64);

#[async_trait]
impl CouncilVoter for ConstantVoter {
    async fn vote(
        &self,
        _voter: &Specialist,
        _task: &Task,
        _output: &TaskOutput,
    ) -> anyhow::Result<VoteDraft> {
        Ok(VoteDraft::new(self.0))
    }
}

fn registry() -> DomainRegistry {
    let mut registry = DomainRegistry::new();
    registry
        .insert(DomainDocument::new("support", "Answer support tickets.").with_weights([("tests", 1.0)]))
        .unwrap();
    registry
        .insert(DomainDocument::new("administration", "Review the work of other specialists."))
        .unwrap();
    registry
}

async fn build(config: EngineConfig, executor: Arc<ScriptedExecutor>, vote: f64) -> Arc<Engine> {
    Engine::builder(config)
        .registry(registry())
        .executor(executor)
        .voter(Arc::new(ConstantVoter(vote)))
        .seed(42)
        .build()
        .await
        .unwrap()
}

async fn ids(engine: &Engine, domain: &str) -> Vec<String> {
    engine.domain_status(domain).await.unwrap().specialist_ids()
}

#[tokio::test]
async fn test_threshold_cycle_culls_weak_specialist() {
    let mut config = EngineConfig::default();
    config.evolution.tasks_per_cycle = 6;
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = build(config, executor.clone(), 0.8).await;

    let ids = ids(&engine, "support").await;
    let weak = ids[2].clone();
    executor.set(&ids[0], 0.9);
    executor.set(&ids[1], 0.85);
    executor.set(&weak, 0.2);

    for id in &ids {
        for _ in 0..2 {
            let task = Task::new("support", json!("ticket"))
                .with_kind("refund")
                .pinned_to(id.clone());
            engine.run_task(task).await.unwrap();
        }
    }

    let status = engine.domain_status("support").await.unwrap();
    assert_eq!(status.generation, 2);
    assert_eq!(status.pool_size, 3);
    assert!(!status.specialist_ids().contains(&weak));

    let archived = engine.list_graveyard(Some("support")).await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].specialist_id, weak);
    assert!(archived[0]
        .failure_patterns
        .contains(&evopool_collective::FailurePattern::EdgeCases));

    let newcomer = status
        .specialists
        .iter()
        .find(|s| s.status == SpecialistStatus::Probation)
        .unwrap();
    assert_eq!(newcomer.task_count, 0);
    assert!(engine.list_graveyard(Some("administration")).await.is_empty());
}

#[tokio::test]
async fn test_ranking_stays_sorted_under_concurrent_tasks() {
    let mut config = EngineConfig::default();
    config.evolution.tasks_per_cycle = 0;
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = build(config, executor.clone(), 0.8).await;
    let ids = ids(&engine, "support").await;
    executor.set(&ids[0], 0.7);
    executor.set(&ids[1], 0.95);
    executor.set(&ids[2], 0.75);

    let mut submitted = Vec::new();
    for i in 0..30 {
        let task = Task::new("support", json!({ "ticket": i }))
            .with_category(BudgetCategory::Benchmark);
        submitted.push(engine.submit(task).await.unwrap());
    }

    for _ in 0..200 {
        let done = submitted
            .iter()
            .all(|id| engine.task(id).map(|r| r.status.is_terminal()).unwrap_or(false));
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = engine.domain_status("support").await.unwrap();
    let total: u64 = status.specialists.iter().map(|s| s.task_count).sum();
    assert_eq!(total, 30);
    for pair in status.specialists.windows(2) {
        assert!(pair[0].average >= pair[1].average);
        if pair[0].average == pair[1].average {
            assert!(pair[0].task_count <= pair[1].task_count);
        }
    }

    let budget = engine.budget_status().await;
    let daily = budget
        .window(BudgetCategory::Benchmark, BudgetWindow::Daily)
        .unwrap();
    // Thirty low-complexity tasks at the economy rate
    assert_eq!(daily.spent, Usd::from_dollars(0.30));
}

#[tokio::test]
async fn test_council_mode_flags_bootstrap_bias() {
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = build(EngineConfig::default(), executor, 0.96).await;
    engine.set_evaluation_mode(EvaluationMode::AiCouncil);

    let record = engine
        .run_task(Task::new("support", json!("ticket")))
        .await
        .unwrap();
    let evaluation = record.evaluation.unwrap();
    assert_eq!(evaluation.evaluator, EvaluatorKind::AiCouncil);
    assert!(evaluation.bootstrap_warning());
    assert!((evaluation.confidence - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_both_mode_records_comparison() {
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = build(EngineConfig::default(), executor, 0.8).await;
    engine.set_evaluation_mode(EvaluationMode::Both);

    for _ in 0..4 {
        let record = engine
            .run_task(Task::new("support", json!("ticket")))
            .await
            .unwrap();
        // The committee stays authoritative
        assert_eq!(
            record.evaluation.unwrap().evaluator,
            EvaluatorKind::ScoringCommittee
        );
    }

    let summary = engine.comparison();
    assert_eq!(summary.pairs, 4);
    assert!(summary.agreement_rate > 0.99);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let executor = Arc::new(ScriptedExecutor::default());

    let first = Engine::builder(EngineConfig::default())
        .registry(registry())
        .executor(executor.clone())
        .voter(Arc::new(ConstantVoter(0.8)))
        .persistence(Arc::new(JsonFilePersistence::new(&path)))
        .build()
        .await
        .unwrap();
    let record = first
        .run_task(Task::new("support", json!("ticket")))
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    first.save_snapshot().await.unwrap();
    let before = first.domain_status("support").await.unwrap();

    let second = Engine::builder(EngineConfig::default())
        .registry(registry())
        .executor(executor)
        .voter(Arc::new(ConstantVoter(0.8)))
        .persistence(Arc::new(JsonFilePersistence::new(&path)))
        .build()
        .await
        .unwrap();
    let after = second.domain_status("support").await.unwrap();
    assert_eq!(after.specialist_ids(), before.specialist_ids());
    assert_eq!(after.generation, before.generation);

    let spent = second
        .budget_status()
        .await
        .window(BudgetCategory::Production, BudgetWindow::Monthly)
        .unwrap()
        .spent;
    assert_eq!(spent, record.cost);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "][").unwrap();

    let result = Engine::builder(EngineConfig::default())
        .registry(registry())
        .executor(Arc::new(ScriptedExecutor::default()))
        .voter(Arc::new(ConstantVoter(0.8)))
        .persistence(Arc::new(JsonFilePersistence::new(&path)))
        .build()
        .await;
    match result {
        Err(err @ EngineError::CorruptStore(_)) => assert!(!err.is_recoverable()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("corrupt snapshot was accepted"),
    }
}
