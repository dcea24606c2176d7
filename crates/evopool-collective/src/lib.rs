//! Specialist pool evolution and weighted-council evaluation.
//!
//! Each task domain keeps a pool of competing specialists. Tasks are routed
//! to the best current specialist, their results are scored, and the pool
//! periodically culls its weakest member and spawns a replacement seeded
//! with lessons distilled from past failures:
//!
//! - **Selection**: best, weighted (60/30/10) or round-robin over the ranked pool
//! - **Evaluation**: a weighted scoring committee, a voting council, or both
//!   side by side with agreement statistics
//! - **Voting**: performance- and happiness-weighted votes with outlier rejection
//! - **Evolution**: culling, graveyard archival, failure analysis, learnings,
//!   respawning and convergence detection
//! - **Admission**: complexity classification and per-category budget windows
//!
//! # Usage
//!
//! ```ignore
//! use evopool_collective::{Engine, Task, TaskPriority};
//!
//! let engine = Engine::builder(config)
//!     .registry(registry)
//!     .executor(executor)
//!     .voter(voter)
//!     .build()
//!     .await?;
//!
//! let task_id = engine
//!     .submit_task("code_generation", payload, TaskPriority::Normal)
//!     .await?;
//! let status = engine.domain_status("code_generation").await?;
//! ```

pub mod budget;
pub mod complexity;
pub mod convergence;
pub mod engine;
pub mod evaluation;
pub mod evolution;
pub mod executor;
pub mod graveyard;
pub mod happiness;
pub mod persistence;
pub mod pool;
pub mod scheduler;
pub mod spawner;
pub mod specialist;
pub mod store;
pub mod task;
pub mod types;
pub mod voting;

// Re-export main types for convenience
pub use budget::{BudgetCategory, BudgetSignal, BudgetSnapshot, BudgetStore, BudgetWindow, Usd};
pub use complexity::{ComplexityRouter, RoutePlan};
pub use convergence::{ConvergenceDetector, ConvergenceReport};
pub use engine::{Engine, EngineBuilder};
pub use evaluation::{
    ComparisonSummary, EvaluationController, EvaluationResult, Evaluator, EvaluatorKind,
};
pub use evolution::{CycleReport, EvolutionController};
pub use executor::{CouncilVoter, TaskExecutor, VoteDraft};
pub use graveyard::{FailurePattern, Graveyard, GraveyardEntry, Learning, LearningBook};
pub use happiness::HappinessEvent;
pub use persistence::{EngineSnapshot, JsonFilePersistence, MemoryPersistence, Persistence};
pub use pool::{DomainPool, DomainStatus, SelectionMode};
pub use scheduler::{EvolutionScheduler, SchedulerHandle};
pub use specialist::{Specialist, SpecialistConfig, SpecialistStatus, SpecialistSummary};
pub use task::{
    ComplexitySignals, EditSeverity, HumanFeedback, Task, TaskOutput, TaskPriority, TaskRecord,
    TaskStatus,
};
pub use types::{Domain, EngineError, Result, SpecialistId, TaskId};
pub use voting::{RoundOutcome, Vote, VoteAggregator, VoterKind};
