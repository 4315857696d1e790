//! Workers: what actually executes a task.
//!
//! The dispatcher only ever talks to the [`Worker`] trait. In a normal run
//! a tier's configured command line becomes a [`ProcessWorker`] speaking
//! the line-event protocol over stdin/stdout; tiers without a command (and
//! every test) use the deterministic [`ScriptedWorker`] instead.

pub mod process;
pub mod scripted;

pub use process::ProcessWorker;
pub use scripted::{ScriptedReply, ScriptedWorker};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactFragment;
use crate::dispatch::task::TaskSpec;
use crate::error::Result;
use crate::router::WorkerProfile;

/// Everything a worker hands back for one task.
///
/// `cost_cents` is reported even when the worker failed: the spend already
/// happened and the ledger still has to see it.
#[derive(Debug, Clone)]
pub struct WorkerReply {
    pub success: bool,
    pub summary: String,
    pub cost_cents: u64,
    pub fragments: Vec<ArtifactFragment>,
}

/// One task executor.
///
/// `run` resolves when the task is done, the worker failed in a way it
/// could report, or `cancel` fired. An `Err` means the worker could not
/// run at all (spawn failure, protocol breakdown) and no cost is known.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short label for log lines.
    fn describe(&self) -> String;

    async fn run(&self, task: &TaskSpec, cancel: &CancellationToken) -> Result<WorkerReply>;
}

/// Chooses the worker implementation for a routing profile.
pub trait WorkerFactory: Send + Sync {
    fn worker_for(&self, profile: &WorkerProfile) -> Arc<dyn Worker>;
}

/// Production selection: configured command line if the tier has one,
/// dry-run scripted worker otherwise.
#[derive(Debug, Default)]
pub struct DefaultWorkerFactory;

impl WorkerFactory for DefaultWorkerFactory {
    fn worker_for(&self, profile: &WorkerProfile) -> Arc<dyn Worker> {
        match &profile.command {
            Some(_) => Arc::new(ProcessWorker::new(profile.clone())),
            None => Arc::new(ScriptedWorker::dry_run(profile.clone())),
        }
    }
}
