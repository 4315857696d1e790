//! Task model shared by the planner, the dispatcher, and the transcript.
//!
//! A [`TaskSpec`] is one unit of work carved out of the directive. Running
//! it produces either a [`TaskOutcome`] (summary, cost, artifact fragments)
//! or a [`TaskFailure`] carrying whatever cost was still incurred.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactFragment;
use crate::router::WorkerRole;

/// One planned unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: Uuid,
    /// Full instruction handed to the worker, context included.
    pub goal: String,
    /// Which routing profile runs this task.
    pub role: WorkerRole,
}

impl TaskSpec {
    pub fn new(goal: impl Into<String>, role: WorkerRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            role,
        }
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    /// The worker process errored, violated the reply protocol, or reported
    /// failure itself.
    Worker,
    /// The task exceeded its wall-clock allowance.
    Timeout,
    /// The ledger rejected the task's charge; the session is out of budget.
    Budget,
}

impl TaskFailureKind {
    /// Budget rejections end the session; everything else may be replanned.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskFailureKind::Budget)
    }
}

impl std::fmt::Display for TaskFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailureKind::Worker => write!(f, "worker"),
            TaskFailureKind::Timeout => write!(f, "timeout"),
            TaskFailureKind::Budget => write!(f, "budget"),
        }
    }
}

/// A task that ran to completion and whose cost was accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub summary: String,
    pub cost_cents: u64,
    pub fragments: Vec<ArtifactFragment>,
}

/// A task that did not complete. `cost_cents` records any charge the ledger
/// accepted before the failure; money spent on a failed task stays spent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub kind: TaskFailureKind,
    pub message: String,
    pub cost_cents: u64,
}

pub type TaskResult = std::result::Result<TaskOutcome, TaskFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_failures_are_not_retryable() {
        assert!(TaskFailureKind::Worker.is_retryable());
        assert!(TaskFailureKind::Timeout.is_retryable());
        assert!(!TaskFailureKind::Budget.is_retryable());
    }

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&TaskFailureKind::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }
}
