//! Error taxonomy for the runner.
//!
//! # Propagation policy
//! - Task-level failures (worker errors, timeouts, rejected charges) are
//!   classified by the dispatcher into [`crate::dispatch::TaskFailure`]
//!   values and never surface here directly.
//! - Budget and retry exhaustion abort a session through its report and
//!   the recorded [`crate::transcript::AbortReason`], not through an
//!   error. The variants here are the conditions that end a run with an
//!   `Err` instead of a report.

use std::path::PathBuf;

use thiserror::Error;

/// Shared error type for the runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The session request failed validation. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A worker failed in a way the session could not recover from.
    #[error("worker error: {0}")]
    Worker(String),

    /// The requested model tier is not configured.
    #[error("unknown model tier '{0}'")]
    UnknownTier(String),

    /// The output location holds content that differs from this session's
    /// artifacts and no overwrite policy was granted.
    #[error("output conflict at {path}: {detail}")]
    OutputConflict { path: PathBuf, detail: String },

    /// A transcript violated ordering or was truncated before a terminal
    /// event. Replay-only.
    #[error("corrupt transcript: {0}")]
    CorruptTranscript(String),

    /// Configuration file or override could not be used.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure outside the artifact staging path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transcript or worker wire data failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupt_transcript(msg: impl Into<String>) -> Self {
        Self::CorruptTranscript(msg.into())
    }

    /// Check for the one error class that must never dispatch a task.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    /// Process exit code for a session that ended with this error.
    ///
    /// `0` is reserved for `Completed`/`Replayed`; `2` marks a rejected
    /// request, `3` an aborted session, `1` everything unexpected.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) | Self::UnknownTier(_) => 2,
            Self::Worker(_) | Self::OutputConflict { .. } => 3,
            Self::CorruptTranscript(_) | Self::Config(_) | Self::Io(_) | Self::Serde(_) => 1,
        }
    }
}

impl From<serde_yaml::Error> for RunnerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A type alias for `Result<T, RunnerError>`.
pub type Result<T> = std::result::Result<T, RunnerError>;
