//! Seams to the outside world.
//!
//! The engine never talks to a model provider directly. Running a task and
//! casting a council vote both go through these traits so callers can plug
//! in whatever backend they use.

use crate::specialist::Specialist;
use crate::task::{Task, TaskOutput};
use anyhow::Result;
use async_trait::async_trait;

/// Executes a task with a given specialist.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` with the configuration of `specialist`.
    ///
    /// Errors are treated as a failed task, not as an engine failure.
    async fn execute(&self, specialist: &Specialist, task: &Task) -> Result<TaskOutput>;
}

/// A voter's scored opinion on a task result.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteDraft {
    pub score: f64,
    pub rationale: Option<String>,
}

impl VoteDraft {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            rationale: None,
        }
    }
}

/// Asks a specialist to score another specialist's output.
#[async_trait]
pub trait CouncilVoter: Send + Sync {
    async fn vote(&self, voter: &Specialist, task: &Task, output: &TaskOutput) -> Result<VoteDraft>;
}
