//! Worker that drives an external CLI process.
//!
//! The task goal is written to the child's stdin, stdin is closed, and the
//! child streams newline-delimited JSON events back on stdout:
//!
//! ```text
//! {"type":"log","message":"compiling scan loop"}
//! {"type":"file","path":"src/scan.c","content_b64":"aW50IG1haW4..."}
//! {"type":"result","success":true,"cost_usd":0.42,"summary":"done"}
//! ```
//!
//! `result` ends the exchange. Cancellation kills the child outright so it
//! stops spending the moment the session gives up on it.

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::artifact::ArtifactFragment;
use crate::budget::usd_to_cents;
use crate::dispatch::task::TaskSpec;
use crate::error::{Result, RunnerError};
use crate::router::WorkerProfile;
use crate::worker::{Worker, WorkerReply};

/// Events a worker process may emit, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerEvent {
    Log {
        message: String,
    },
    File {
        path: String,
        content_b64: String,
    },
    Result {
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        summary: String,
    },
}

fn default_success() -> bool {
    true
}

pub struct ProcessWorker {
    profile: WorkerProfile,
}

impl ProcessWorker {
    pub fn new(profile: WorkerProfile) -> Self {
        Self { profile }
    }

    /// Expand the configured argv, substituting `{model}` placeholders.
    fn argv(&self) -> Result<Vec<String>> {
        let command = self.profile.command.as_ref().ok_or_else(|| {
            RunnerError::Worker(format!(
                "tier '{}' has no worker command configured",
                self.profile.tier
            ))
        })?;
        Ok(command
            .iter()
            .map(|arg| arg.replace("{model}", &self.profile.model))
            .collect())
    }
}

#[async_trait::async_trait]
impl Worker for ProcessWorker {
    fn describe(&self) -> String {
        format!("process worker ({} / {})", self.profile.tier, self.profile.model)
    }

    async fn run(&self, task: &TaskSpec, cancel: &CancellationToken) -> Result<WorkerReply> {
        let argv = self.argv()?;
        let (program, args) = argv.split_first().ok_or_else(|| {
            RunnerError::Worker(format!("tier '{}' has an empty worker command", self.profile.tier))
        })?;

        tracing::info!(
            task_id = %task.id,
            tier = %self.profile.tier,
            model = %self.profile.model,
            program = %program,
            "starting worker process"
        );

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Worker(format!("failed to start worker '{}': {}", program, e)))?;

        // Feed the goal and close stdin so the child knows input is complete.
        if let Some(mut stdin) = child.stdin.take() {
            let goal = task.goal.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(goal.as_bytes()).await {
                    tracing::error!("failed to write task goal to worker stdin: {e}");
                }
                drop(stdin);
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Worker("failed to capture worker stdout".to_string()))?;

        // Collect stderr in the background for failure diagnostics.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut collected = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push(line);
                }
                collected
            })
        });

        let mut fragments: Vec<ArtifactFragment> = Vec::new();
        let mut cost_usd = 0.0f64;
        let mut summary = String::new();
        let mut success = true;
        let mut saw_result = false;

        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(task_id = %task.id, "worker cancelled, killing process");
                    let _ = child.kill().await;
                    return Err(RunnerError::Worker("task cancelled before completion".to_string()));
                }
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let event: WorkerEvent = match serde_json::from_str(&line) {
                                Ok(event) => event,
                                Err(e) => {
                                    tracing::warn!(
                                        task_id = %task.id,
                                        "unparseable worker event: {} - line: {}",
                                        e,
                                        truncate_for_log(&line)
                                    );
                                    continue;
                                }
                            };
                            match event {
                                WorkerEvent::Log { message } => {
                                    tracing::debug!(task_id = %task.id, "worker: {message}");
                                }
                                WorkerEvent::File { path, content_b64 } => {
                                    match ArtifactFragment::from_base64(path, content_b64) {
                                        Ok(fragment) => fragments.push(fragment),
                                        Err(reason) => {
                                            let _ = child.kill().await;
                                            return Err(RunnerError::Worker(format!(
                                                "worker emitted an unusable file event: {reason}"
                                            )));
                                        }
                                    }
                                }
                                WorkerEvent::Result { success: ok, cost_usd: cost, summary: text } => {
                                    saw_result = true;
                                    success = ok;
                                    cost_usd = cost;
                                    summary = text;
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(task_id = %task.id, "error reading worker output: {e}");
                            break;
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr_tail = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !saw_result {
            success = false;
            summary = format!(
                "worker exited ({}) without a result event{}",
                status,
                format_stderr_tail(&stderr_tail)
            );
        }

        let cost_cents = usd_to_cents(cost_usd);
        tracing::info!(
            task_id = %task.id,
            tier = %self.profile.tier,
            cost_cents,
            success,
            files = fragments.len(),
            "worker process finished"
        );

        Ok(WorkerReply {
            success,
            summary,
            cost_cents,
            fragments,
        })
    }
}

fn truncate_for_log(line: &str) -> String {
    match line.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

fn format_stderr_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let tail: Vec<&str> = lines.iter().rev().take(5).rev().map(|s| s.as_str()).collect();
    format!("; stderr: {}", tail.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::WorkerRole;

    fn profile(command: Vec<&str>) -> WorkerProfile {
        WorkerProfile {
            tier: "pro".to_string(),
            model: "test-model".to_string(),
            command: Some(command.into_iter().map(String::from).collect()),
            flat_cost_cents: 5,
        }
    }

    fn task(goal: &str) -> TaskSpec {
        TaskSpec::new(goal, WorkerRole::Primary)
    }

    #[test]
    fn test_argv_substitutes_model_placeholder() {
        let worker = ProcessWorker::new(profile(vec!["llm-cli", "--model", "{model}"]));
        let argv = worker.argv().unwrap();
        assert_eq!(argv, vec!["llm-cli", "--model", "test-model"]);
    }

    #[tokio::test]
    async fn test_runs_a_scripted_shell_worker() {
        // A stand-in worker that ignores its input and emits one file plus
        // a result event.
        let script = r#"cat > /dev/null; \
echo '{"type":"log","message":"working"}'; \
echo '{"type":"file","path":"out.txt","content_b64":"aGVsbG8="}'; \
echo '{"type":"result","success":true,"cost_usd":0.12,"summary":"wrote out.txt"}'"#;
        let worker = ProcessWorker::new(profile(vec!["sh", "-c", script]));

        let reply = worker
            .run(&task("write a greeting"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(reply.cost_cents, 12);
        assert_eq!(reply.summary, "wrote out.txt");
        assert_eq!(reply.fragments.len(), 1);
        assert_eq!(reply.fragments[0].content().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_result_event_is_a_failure() {
        let worker = ProcessWorker::new(profile(vec!["sh", "-c", "cat > /dev/null; true"]));
        let reply = worker
            .run(&task("anything"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.summary.contains("without a result event"));
        assert_eq!(reply.cost_cents, 0);
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let worker = ProcessWorker::new(profile(vec!["sh", "-c", "cat > /dev/null; sleep 30"]));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let err = worker.run(&task("hang"), &cancel).await.unwrap_err();
        assert!(matches!(err, RunnerError::Worker(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_worker_error() {
        let worker = ProcessWorker::new(profile(vec!["definitely-not-a-real-binary-9f3b"]));
        let err = worker
            .run(&task("anything"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Worker(_)));
    }
}
