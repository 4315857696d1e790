//! Budget-capped orchestration for delegated build directives.
//!
//! A caller hands the runner a [`session::SessionRequest`]: a natural-language
//! directive, an output directory name, a model tier, and a hard spending cap.
//! The [`session::SessionController`] plans the directive into tasks, runs
//! them through model workers under a serialized budget ledger, and records
//! every decision as an ordered JSONL transcript before acting on it. The
//! artifacts a completed session writes are folded out of that transcript,
//! so replaying the recording later reproduces the same bytes without
//! spending anything.

pub mod artifact;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod replay;
pub mod router;
pub mod session;
pub mod transcript;
pub mod worker;

pub use config::RunnerConfig;
pub use error::{Result, RunnerError};
pub use session::{SessionController, SessionReport, SessionRequest};
