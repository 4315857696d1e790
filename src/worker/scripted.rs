//! Deterministic in-process worker.
//!
//! Tiers configured without a command run here: each task is acknowledged
//! at the tier's flat cost without touching any external service, which
//! makes dry runs and the whole test suite hermetic. Tests can also queue
//! explicit [`ScriptedReply`]s to act out specific worker behavior.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactFragment;
use crate::dispatch::task::TaskSpec;
use crate::error::{Result, RunnerError};
use crate::router::WorkerProfile;
use crate::worker::{Worker, WorkerReply};

/// One pre-programmed reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub success: bool,
    pub summary: String,
    pub cost_cents: u64,
    pub fragments: Vec<ArtifactFragment>,
}

impl ScriptedReply {
    pub fn completed(summary: impl Into<String>, cost_cents: u64) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            cost_cents,
            fragments: Vec::new(),
        }
    }

    pub fn failed(summary: impl Into<String>, cost_cents: u64) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            cost_cents,
            fragments: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.fragments.push(ArtifactFragment::new(path, content));
        self
    }
}

pub struct ScriptedWorker {
    profile: WorkerProfile,
    script: Mutex<VecDeque<ScriptedReply>>,
    delay: Option<Duration>,
}

impl ScriptedWorker {
    /// The production fallback: every task succeeds with no artifacts at
    /// the tier's flat cost.
    pub fn dry_run(profile: WorkerProfile) -> Self {
        Self {
            profile,
            script: Mutex::new(VecDeque::new()),
            delay: None,
        }
    }

    /// A worker that plays back `replies` in order, then falls back to
    /// dry-run behavior.
    pub fn with_script(profile: WorkerProfile, replies: Vec<ScriptedReply>) -> Self {
        Self {
            profile,
            script: Mutex::new(replies.into()),
            delay: None,
        }
    }

    /// Make each task take `delay` of wall time before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn dry_run_reply(&self, task: &TaskSpec) -> ScriptedReply {
        let first_line = task.goal.lines().next().unwrap_or_default();
        ScriptedReply::completed(
            format!("dry run ({}): {}", self.profile.tier, first_line),
            self.profile.flat_cost_cents,
        )
    }
}

#[async_trait::async_trait]
impl Worker for ScriptedWorker {
    fn describe(&self) -> String {
        format!("scripted worker ({})", self.profile.tier)
    }

    async fn run(&self, task: &TaskSpec, cancel: &CancellationToken) -> Result<WorkerReply> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RunnerError::Worker("task cancelled before completion".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        } else if cancel.is_cancelled() {
            return Err(RunnerError::Worker("task cancelled before completion".to_string()));
        }

        let reply = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.dry_run_reply(task));

        tracing::debug!(
            task_id = %task.id,
            tier = %self.profile.tier,
            cost_cents = reply.cost_cents,
            success = reply.success,
            "scripted worker replied"
        );

        Ok(WorkerReply {
            success: reply.success,
            summary: reply.summary,
            cost_cents: reply.cost_cents,
            fragments: reply.fragments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::WorkerRole;

    fn profile() -> WorkerProfile {
        WorkerProfile {
            tier: "fast".to_string(),
            model: "test-model".to_string(),
            command: None,
            flat_cost_cents: 2,
        }
    }

    #[tokio::test]
    async fn test_dry_run_charges_flat_cost() {
        let worker = ScriptedWorker::dry_run(profile());
        let task = TaskSpec::new("do something", WorkerRole::Primary);
        let reply = worker.run(&task, &CancellationToken::new()).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.cost_cents, 2);
        assert!(reply.fragments.is_empty());
    }

    #[tokio::test]
    async fn test_script_plays_back_in_order() {
        let worker = ScriptedWorker::with_script(
            profile(),
            vec![
                ScriptedReply::completed("first", 10).with_file("a.txt", b"a"),
                ScriptedReply::failed("second blew up", 3),
            ],
        );
        let task = TaskSpec::new("x", WorkerRole::SubAgent);

        let first = worker.run(&task, &CancellationToken::new()).await.unwrap();
        assert!(first.success);
        assert_eq!(first.fragments.len(), 1);

        let second = worker.run(&task, &CancellationToken::new()).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.cost_cents, 3);

        // Script exhausted: dry-run behavior takes over.
        let third = worker.run(&task, &CancellationToken::new()).await.unwrap();
        assert!(third.success);
        assert_eq!(third.cost_cents, 2);
    }

    #[tokio::test]
    async fn test_delayed_worker_honors_cancellation() {
        let worker =
            ScriptedWorker::dry_run(profile()).with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let task = TaskSpec::new("slow", WorkerRole::Primary);
        let err = worker.run(&task, &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::Worker(_)));
    }
}
