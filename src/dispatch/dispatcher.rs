//! Bounded, budget-aware execution of a plan.
//!
//! Tasks are admitted strictly in plan order through a semaphore sized to
//! the configured concurrency limit, so at most that many workers run at
//! once and a burst of tasks cannot jump the queue. Every observable step
//! (dispatch, charge, completion, failure) is appended to the transcript
//! before the dispatcher acts on it.
//!
//! A worker's reported cost is proposed to the ledger *before* the reply
//! is treated as usable; a rejected charge discards the reply, fails the
//! task as a budget failure, and cancels everything still in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetLedger, ChargeDecision};
use crate::config::RunnerConfig;
use crate::dispatch::policy::Plan;
use crate::dispatch::task::{TaskFailure, TaskFailureKind, TaskOutcome, TaskResult, TaskSpec};
use crate::error::{Result, RunnerError};
use crate::router::ModelRouter;
use crate::transcript::{SessionEvent, TranscriptRecorder};
use crate::worker::{Worker, WorkerFactory};

pub struct Dispatcher {
    limit: usize,
    task_timeout: Duration,
    factory: Arc<dyn WorkerFactory>,
}

enum Admission {
    Spawned(tokio::task::JoinHandle<Result<TaskResult>>),
    Skipped(TaskFailure),
}

impl Dispatcher {
    pub fn new(config: &RunnerConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            limit: config.max_concurrent_tasks,
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            factory,
        }
    }

    /// Run every task in the plan, returning per-task results in plan
    /// order. `Err` is reserved for infrastructure failures (a transcript
    /// that cannot be written, a panicked task); ordinary worker trouble
    /// is a `TaskFailure` inside the result vector.
    pub async fn run_plan(
        &self,
        plan: &Plan,
        router: &ModelRouter,
        tier: &str,
        ledger: Arc<BudgetLedger>,
        recorder: Arc<TranscriptRecorder>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>> {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut admissions: Vec<Admission> = Vec::with_capacity(plan.tasks.len());
        let mut fatal: Option<RunnerError> = None;

        for task in &plan.tasks {
            if cancel.is_cancelled() {
                let failure = not_started(task);
                if let Err(e) = recorder
                    .append(SessionEvent::TaskFailed { failure: failure.clone() })
                    .await
                {
                    fatal = Some(e);
                    break;
                }
                admissions.push(Admission::Skipped(failure));
                continue;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => {
                    Some(permit.expect("semaphore is never closed"))
                }
            };
            // A freed permit and a cancellation can arrive together; the
            // cancellation wins.
            let permit = match permit {
                Some(permit) if !cancel.is_cancelled() => permit,
                _ => {
                    let failure = not_started(task);
                    if let Err(e) = recorder
                        .append(SessionEvent::TaskFailed { failure: failure.clone() })
                        .await
                    {
                        fatal = Some(e);
                        break;
                    }
                    admissions.push(Admission::Skipped(failure));
                    continue;
                }
            };

            let profile = match router.select(tier, task.role) {
                Ok(profile) => profile,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            if let Err(e) = recorder
                .append(SessionEvent::TaskDispatched {
                    task_id: task.id,
                    profile: profile.clone(),
                })
                .await
            {
                fatal = Some(e);
                break;
            }

            let worker = self.factory.worker_for(&profile);
            let handle = tokio::spawn(run_one(
                task.clone(),
                worker,
                permit,
                self.task_timeout,
                Arc::clone(&ledger),
                Arc::clone(&recorder),
                cancel.clone(),
            ));
            admissions.push(Admission::Spawned(handle));
        }

        if fatal.is_some() {
            cancel.cancel();
        }

        let mut results = Vec::with_capacity(admissions.len());
        for admission in admissions {
            match admission {
                Admission::Skipped(failure) => results.push(Err(failure)),
                Admission::Spawned(handle) => match handle.await {
                    Ok(Ok(result)) => results.push(result),
                    Ok(Err(e)) => {
                        cancel.cancel();
                        fatal.get_or_insert(e);
                    }
                    Err(join_err) => {
                        cancel.cancel();
                        fatal.get_or_insert(RunnerError::Worker(format!(
                            "task execution panicked: {join_err}"
                        )));
                    }
                },
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

fn not_started(task: &TaskSpec) -> TaskFailure {
    TaskFailure {
        task_id: task.id,
        kind: TaskFailureKind::Worker,
        message: "not started: session is shutting down".to_string(),
        cost_cents: 0,
    }
}

async fn run_one(
    task: TaskSpec,
    worker: Arc<dyn Worker>,
    permit: tokio::sync::OwnedSemaphorePermit,
    task_timeout: Duration,
    ledger: Arc<BudgetLedger>,
    recorder: Arc<TranscriptRecorder>,
    session_cancel: CancellationToken,
) -> Result<TaskResult> {
    // Held until this task fully settles, charge included.
    let _permit = permit;
    let task_cancel = session_cancel.child_token();

    tracing::debug!(task_id = %task.id, worker = %worker.describe(), "task running");

    let reply = match tokio::time::timeout(task_timeout, worker.run(&task, &task_cancel)).await {
        Err(_elapsed) => {
            let failure = TaskFailure {
                task_id: task.id,
                kind: TaskFailureKind::Timeout,
                message: format!("no result within {}s", task_timeout.as_secs()),
                cost_cents: 0,
            };
            tracing::warn!(task_id = %task.id, timeout_secs = task_timeout.as_secs(), "task timed out");
            recorder
                .append(SessionEvent::TaskFailed { failure: failure.clone() })
                .await?;
            return Ok(Err(failure));
        }
        Ok(Err(e)) => {
            let failure = TaskFailure {
                task_id: task.id,
                kind: TaskFailureKind::Worker,
                message: e.to_string(),
                cost_cents: 0,
            };
            recorder
                .append(SessionEvent::TaskFailed { failure: failure.clone() })
                .await?;
            return Ok(Err(failure));
        }
        Ok(Ok(reply)) => reply,
    };

    // The money is settled before the reply is allowed to matter.
    let mut charged_cents = 0;
    if reply.cost_cents > 0 {
        match ledger.propose(reply.cost_cents, task.id).await {
            ChargeDecision::Accepted(entry) => {
                recorder
                    .append(SessionEvent::ChargeAccepted {
                        task_id: task.id,
                        amount_cents: entry.amount_cents,
                        total_cents: entry.total_after_cents,
                    })
                    .await?;
                charged_cents = entry.amount_cents;
            }
            ChargeDecision::Rejected {
                amount_cents,
                remaining_cents,
            } => {
                recorder
                    .append(SessionEvent::ChargeRejected {
                        task_id: task.id,
                        amount_cents,
                        remaining_cents,
                    })
                    .await?;
                let failure = TaskFailure {
                    task_id: task.id,
                    kind: TaskFailureKind::Budget,
                    message: format!(
                        "charge of {amount_cents} cents refused with {remaining_cents} cents remaining"
                    ),
                    cost_cents: 0,
                };
                recorder
                    .append(SessionEvent::TaskFailed { failure: failure.clone() })
                    .await?;
                // Out of budget: nothing else may keep spending.
                session_cancel.cancel();
                return Ok(Err(failure));
            }
        }
    }

    if reply.success {
        let outcome = TaskOutcome {
            task_id: task.id,
            summary: reply.summary,
            cost_cents: charged_cents,
            fragments: reply.fragments,
        };
        recorder
            .append(SessionEvent::TaskCompleted {
                outcome: outcome.clone(),
            })
            .await?;
        Ok(Ok(outcome))
    } else {
        let failure = TaskFailure {
            task_id: task.id,
            kind: TaskFailureKind::Worker,
            message: reply.summary,
            cost_cents: charged_cents,
        };
        recorder
            .append(SessionEvent::TaskFailed { failure: failure.clone() })
            .await?;
        Ok(Err(failure))
    }
}
