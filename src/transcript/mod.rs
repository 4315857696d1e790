//! The transcript: an append-only record of every session decision.
//!
//! Each line of a transcript file is one [`TranscriptEvent`]: a sequence
//! number, a timestamp, and a [`SessionEvent`] payload. The stream is
//! written durably as the session runs and is the *only* input the replay
//! engine consumes, so every fact replay needs (the original request, each
//! plan, each accepted charge, each task's artifact fragments, the terminal
//! outcome) is embedded right here.
//!
//! # Invariants
//! - `seq` starts at 0 and increases by exactly 1 per event
//! - the first event is `session_started`, the last is `session_terminated`
//! - events are never rewritten; a crash leaves at most one partial
//!   trailing line

mod recorder;

pub use recorder::{read_transcript, transcript_path, TranscriptRecorder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::dispatch::task::{TaskFailure, TaskOutcome, TaskSpec};
use crate::router::WorkerProfile;
use crate::session::SessionRequest;

/// One recorded line: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Everything a session can record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Always first. Carries the full request so a transcript is
    /// self-describing.
    SessionStarted {
        session_id: Uuid,
        identity: String,
        request: SessionRequest,
    },
    /// A decomposition attempt. Attempt 0 is the initial plan; later
    /// attempts are recovery plans after retryable failures.
    PlanProduced { attempt: u32, tasks: Vec<TaskSpec> },
    /// A task was handed to a worker under the given routing profile.
    TaskDispatched { task_id: Uuid, profile: WorkerProfile },
    /// The ledger accepted a charge.
    ChargeAccepted {
        task_id: Uuid,
        amount_cents: u64,
        total_cents: u64,
    },
    /// The ledger refused a charge; the session is out of budget.
    ChargeRejected {
        task_id: Uuid,
        amount_cents: u64,
        remaining_cents: u64,
    },
    /// A task finished and its cost was committed. Fragments are embedded
    /// so replay can rebuild artifacts byte for byte.
    TaskCompleted { outcome: TaskOutcome },
    /// A task did not finish.
    TaskFailed { failure: TaskFailure },
    /// The artifact tree was written under the output root.
    ArtifactsMaterialized { paths: Vec<PathBuf> },
    /// Always last.
    SessionTerminated { outcome: SessionOutcome },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::PlanProduced { .. } => "plan_produced",
            SessionEvent::TaskDispatched { .. } => "task_dispatched",
            SessionEvent::ChargeAccepted { .. } => "charge_accepted",
            SessionEvent::ChargeRejected { .. } => "charge_rejected",
            SessionEvent::TaskCompleted { .. } => "task_completed",
            SessionEvent::TaskFailed { .. } => "task_failed",
            SessionEvent::ArtifactsMaterialized { .. } => "artifacts_materialized",
            SessionEvent::SessionTerminated { .. } => "session_terminated",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed { total_cost_cents: u64 },
    Aborted { reason: AbortReason, message: String },
}

/// Why a session aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    BudgetExhausted,
    RetriesExhausted,
    OutputConflict,
    Cancelled,
    /// Session machinery failed (unwritable transcript, panicked task).
    Internal,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::BudgetExhausted => write!(f, "budget exhausted"),
            AbortReason::RetriesExhausted => write!(f, "retries exhausted"),
            AbortReason::OutputConflict => write!(f, "output conflict"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::Internal => write!(f, "internal failure"),
        }
    }
}
