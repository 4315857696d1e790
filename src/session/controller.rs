//! The session controller: one request, driven end to end.
//!
//! A live run walks `Initializing → Dispatching → Awaiting` per plan
//! attempt, then `Finalizing → Completed` or straight to `Aborted`. Each
//! decision is on disk in the transcript before the controller acts on it,
//! and the final artifact tree is folded back *out of that transcript*
//! before materialization, so a later replay rebuilds the output from the
//! identical byte stream the live run used.
//!
//! With the replay flag set and a recording present, no worker starts, no
//! ledger opens, and nothing is appended: the recording is folded and its
//! outcome reproduced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::artifact::{self, ArtifactSet};
use crate::budget::BudgetLedger;
use crate::config::RunnerConfig;
use crate::dispatch::{self, Dispatcher, TaskFailure, TaskFailureKind};
use crate::error::{Result, RunnerError};
use crate::replay;
use crate::router::ModelRouter;
use crate::session::{AbortInfo, Session, SessionReport, SessionRequest, SessionState};
use crate::transcript::{
    read_transcript, transcript_path, AbortReason, SessionEvent, SessionOutcome,
    TranscriptRecorder,
};
use crate::worker::{DefaultWorkerFactory, WorkerFactory};

pub struct SessionController {
    config: RunnerConfig,
    router: ModelRouter,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultWorkerFactory))
    }

    /// Build a controller with a specific worker selection, which is how
    /// tests substitute scripted workers.
    pub fn with_factory(config: RunnerConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        let router = ModelRouter::new(&config);
        let dispatcher = Dispatcher::new(&config, factory);
        Self {
            config,
            router,
            dispatcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token aborts any session the controller is
    /// running (SIGINT wiring). Each run observes a child of it, so one
    /// session's abort never outlives that session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, request: SessionRequest) -> Result<SessionReport> {
        let session = Session::new(request)?;
        if !self.router.knows(&session.request.tier) {
            return Err(RunnerError::UnknownTier(session.request.tier.clone()));
        }

        let transcript = transcript_path(&self.config.transcripts_dir, &session.identity);

        if session.request.replay {
            if transcript.is_file() {
                return self.replay_recording(session, &transcript).await;
            }
            tracing::info!(
                identity = %session.identity,
                "replay requested but no recording exists, running live"
            );
        }

        self.run_live(session, transcript).await
    }

    /// Reproduce a recorded session without spending anything.
    async fn replay_recording(
        &self,
        mut session: Session,
        transcript: &Path,
    ) -> Result<SessionReport> {
        let events = read_transcript(transcript).await?;
        let replayed = replay::replay(&events)?;
        if replayed.identity != session.identity {
            return Err(RunnerError::corrupt_transcript(format!(
                "recording at {} carries identity {} but the request hashes to {}",
                transcript.display(),
                replayed.identity,
                session.identity
            )));
        }

        let output_root = session.output_root(&self.config.outputs_dir);
        let (written, abort) = match &replayed.outcome {
            SessionOutcome::Completed { .. } => {
                session.transition(SessionState::Finalizing);
                let written = artifact::materialize(
                    &replayed.artifacts,
                    &output_root,
                    session.request.overwrite,
                )
                .await?;
                (written, None)
            }
            SessionOutcome::Aborted { reason, message } => {
                tracing::warn!(
                    session_id = %replayed.session_id,
                    reason = %reason,
                    "recording had aborted; reproducing that outcome"
                );
                (
                    Vec::new(),
                    Some(AbortInfo {
                        reason: *reason,
                        message: message.clone(),
                    }),
                )
            }
        };

        session.transition(SessionState::Replayed);
        tracing::info!(
            session_id = %replayed.session_id,
            cost_cents = replayed.total_cost_cents,
            files = written.len(),
            "session replayed from recording"
        );

        Ok(SessionReport {
            session_id: replayed.session_id,
            identity: session.identity,
            state: SessionState::Replayed,
            cap_cents: session.request.cap_cents(),
            total_cost_cents: replayed.total_cost_cents,
            output_root,
            written,
            transcript: transcript.to_path_buf(),
            abort,
        })
    }

    async fn run_live(&self, mut session: Session, transcript: PathBuf) -> Result<SessionReport> {
        // Child of the interrupt token: a budget abort in this session
        // must never cancel the controller's next run.
        let cancel = self.cancel.child_token();
        tracing::info!(
            session_id = %session.id,
            identity = %session.identity,
            tier = %session.request.tier,
            cap_cents = session.request.cap_cents(),
            delegation = %session.request.delegation,
            "session starting"
        );

        let recorder = Arc::new(TranscriptRecorder::create(&transcript).await?);
        recorder
            .append(SessionEvent::SessionStarted {
                session_id: session.id,
                identity: session.identity.clone(),
                request: session.request.clone(),
            })
            .await?;

        let ledger = Arc::new(BudgetLedger::new(session.request.cap_cents()));

        let abort = match self.drive(&mut session, &recorder, &ledger, &cancel).await {
            Ok(abort) => abort,
            Err(e) => {
                // Best effort: leave a terminal event rather than a
                // dangling recording, then surface the original error.
                let _ = recorder
                    .append(SessionEvent::SessionTerminated {
                        outcome: SessionOutcome::Aborted {
                            reason: AbortReason::Internal,
                            message: e.to_string(),
                        },
                    })
                    .await;
                session.transition(SessionState::Aborted);
                return Err(e);
            }
        };

        let total_cost_cents = ledger.total_committed_cents().await;
        let output_root = session.output_root(&self.config.outputs_dir);

        if let Some(abort) = abort {
            recorder
                .append(SessionEvent::SessionTerminated {
                    outcome: SessionOutcome::Aborted {
                        reason: abort.reason,
                        message: abort.message.clone(),
                    },
                })
                .await?;
            session.transition(SessionState::Aborted);
            tracing::warn!(
                session_id = %session.id,
                reason = %abort.reason,
                cost_cents = total_cost_cents,
                "session aborted: {}",
                abort.message
            );
            return Ok(SessionReport {
                session_id: session.id,
                identity: session.identity.clone(),
                state: SessionState::Aborted,
                cap_cents: session.request.cap_cents(),
                total_cost_cents,
                output_root,
                written: Vec::new(),
                transcript,
                abort: Some(abort),
            });
        }

        session.transition(SessionState::Finalizing);

        // Fold the artifact tree from our own recording; this is the same
        // fold replay performs, so live output and replayed output cannot
        // disagree.
        let artifacts = fold_recorded_artifacts(recorder.path()).await?;
        let written = match artifact::materialize(
            &artifacts,
            &output_root,
            session.request.overwrite,
        )
        .await
        {
            Ok(written) => written,
            Err(RunnerError::OutputConflict { path, detail }) => {
                let message = format!("{}: {}", path.display(), detail);
                recorder
                    .append(SessionEvent::SessionTerminated {
                        outcome: SessionOutcome::Aborted {
                            reason: AbortReason::OutputConflict,
                            message: message.clone(),
                        },
                    })
                    .await?;
                session.transition(SessionState::Aborted);
                tracing::warn!(session_id = %session.id, "session aborted: {message}");
                return Ok(SessionReport {
                    session_id: session.id,
                    identity: session.identity.clone(),
                    state: SessionState::Aborted,
                    cap_cents: session.request.cap_cents(),
                    total_cost_cents,
                    output_root,
                    written: Vec::new(),
                    transcript,
                    abort: Some(AbortInfo {
                        reason: AbortReason::OutputConflict,
                        message,
                    }),
                });
            }
            Err(e) => {
                let _ = recorder
                    .append(SessionEvent::SessionTerminated {
                        outcome: SessionOutcome::Aborted {
                            reason: AbortReason::Internal,
                            message: e.to_string(),
                        },
                    })
                    .await;
                session.transition(SessionState::Aborted);
                return Err(e);
            }
        };

        recorder
            .append(SessionEvent::ArtifactsMaterialized {
                paths: written.clone(),
            })
            .await?;
        recorder
            .append(SessionEvent::SessionTerminated {
                outcome: SessionOutcome::Completed { total_cost_cents },
            })
            .await?;
        session.transition(SessionState::Completed);
        tracing::info!(
            session_id = %session.id,
            cost_cents = total_cost_cents,
            files = written.len(),
            root = %output_root.display(),
            "session completed"
        );

        Ok(SessionReport {
            session_id: session.id,
            identity: session.identity.clone(),
            state: SessionState::Completed,
            cap_cents: session.request.cap_cents(),
            total_cost_cents,
            output_root,
            written,
            transcript,
            abort: None,
        })
    }

    /// Run plan attempts until every task completes or the session must
    /// abort. `Ok(None)` means success; `Ok(Some(_))` carries the abort.
    async fn drive(
        &self,
        session: &mut Session,
        recorder: &Arc<TranscriptRecorder>,
        ledger: &Arc<BudgetLedger>,
        cancel: &CancellationToken,
    ) -> Result<Option<AbortInfo>> {
        let directive = session.request.directive.clone();
        let tier = session.request.tier.clone();
        let max_attempts = self.config.max_redecompositions.saturating_add(1);

        for attempt in 0..max_attempts {
            let plan = if attempt == 0 {
                dispatch::plan(&directive, session.request.delegation)
            } else {
                dispatch::replan(&directive)
            };
            recorder
                .append(SessionEvent::PlanProduced {
                    attempt,
                    tasks: plan.tasks.clone(),
                })
                .await?;
            tracing::info!(
                session_id = %session.id,
                attempt,
                tasks = plan.len(),
                "plan produced"
            );

            session.transition(SessionState::Dispatching);
            let results_fut = self.dispatcher.run_plan(
                &plan,
                &self.router,
                &tier,
                Arc::clone(ledger),
                Arc::clone(recorder),
                cancel,
            );
            session.transition(SessionState::Awaiting);
            let results = results_fut.await?;

            let failures: Vec<&TaskFailure> =
                results.iter().filter_map(|r| r.as_ref().err()).collect();
            if failures.is_empty() {
                return Ok(None);
            }
            if let Some(budget) = failures.iter().find(|f| f.kind == TaskFailureKind::Budget) {
                return Ok(Some(AbortInfo {
                    reason: AbortReason::BudgetExhausted,
                    message: budget.message.clone(),
                }));
            }
            if cancel.is_cancelled() {
                return Ok(Some(AbortInfo {
                    reason: AbortReason::Cancelled,
                    message: "session cancelled".to_string(),
                }));
            }

            let last_message = failures
                .last()
                .map(|f| f.message.clone())
                .unwrap_or_default();
            if attempt + 1 == max_attempts {
                return Ok(Some(AbortInfo {
                    reason: AbortReason::RetriesExhausted,
                    message: format!(
                        "{} of {} tasks failed after {} plan attempt(s); last failure: {}",
                        failures.len(),
                        results.len(),
                        max_attempts,
                        last_message
                    ),
                }));
            }
            tracing::warn!(
                session_id = %session.id,
                attempt,
                failed = failures.len(),
                "plan attempt failed, replanning: {last_message}"
            );
        }
        unreachable!("the final attempt always returns");
    }
}

/// Rebuild the artifact set from the completion events of a recording.
async fn fold_recorded_artifacts(path: &Path) -> Result<ArtifactSet> {
    let events = read_transcript(path).await?;
    let mut artifacts = ArtifactSet::new();
    for entry in &events {
        if let SessionEvent::TaskCompleted { outcome } = &entry.event {
            for fragment in &outcome.fragments {
                artifacts.insert_fragment(fragment).map_err(|reason| {
                    RunnerError::corrupt_transcript(format!("seq {}: {}", entry.seq, reason))
                })?;
            }
        }
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::WorkerProfile;
    use crate::worker::{ScriptedReply, ScriptedWorker, Worker};

    struct FixedFactory(Arc<dyn Worker>);

    impl WorkerFactory for FixedFactory {
        fn worker_for(&self, _profile: &WorkerProfile) -> Arc<dyn Worker> {
            Arc::clone(&self.0)
        }
    }

    fn test_profile() -> WorkerProfile {
        WorkerProfile {
            tier: "pro".to_string(),
            model: "m".to_string(),
            command: None,
            flat_cost_cents: 5,
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.transcripts_dir = dir.path().join("transcripts");
        config.outputs_dir = dir.path().join("out");
        config.max_concurrent_tasks = 2;
        config.max_redecompositions = 1;
        config
    }

    fn request(directive: &str, limit_usd: f64) -> SessionRequest {
        SessionRequest {
            directive: directive.to_string(),
            output_name: "result".to_string(),
            tier: "pro".to_string(),
            limit_usd,
            replay: false,
            delegation: crate::dispatch::DelegationMode::Auto,
            overwrite: false,
        }
    }

    fn controller_with_script(
        config: RunnerConfig,
        replies: Vec<ScriptedReply>,
    ) -> SessionController {
        let worker = Arc::new(ScriptedWorker::with_script(test_profile(), replies));
        SessionController::with_factory(config, Arc::new(FixedFactory(worker)))
    }

    #[tokio::test]
    async fn test_completed_session_writes_artifacts_and_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let controller = controller_with_script(
            config.clone(),
            vec![ScriptedReply::completed("wrote files", 40)
                .with_file("README.md", b"# result\n")
                .with_file("src/main.c", b"int main(void){return 0;}\n")],
        );

        let report = controller.run(request("build it", 10.0)).await.unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.total_cost_cents, 40);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.written.len(), 2);
        assert!(report.output_root.join("src/main.c").is_file());

        // The recording must itself replay cleanly.
        let events = read_transcript(&report.transcript).await.unwrap();
        let replayed = replay::replay(&events).unwrap();
        assert_eq!(replayed.total_cost_cents, 40);
    }

    #[tokio::test]
    async fn test_over_cap_session_aborts_with_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        // 11 cents of work against a 10 cent cap.
        let controller = controller_with_script(
            config,
            vec![ScriptedReply::completed("too expensive", 11).with_file("x.txt", b"x")],
        );

        let report = controller.run(request("small job", 0.10)).await.unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(report.exit_code(), 3);
        let abort = report.abort.unwrap();
        assert_eq!(abort.reason, AbortReason::BudgetExhausted);
        assert_eq!(report.total_cost_cents, 0);
        assert!(!report.output_root.exists(), "no artifacts may be written");
        assert!(report.written.is_empty());
    }

    #[tokio::test]
    async fn test_budget_abort_does_not_cancel_later_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        // One controller, two sessions: the first blows its cap, the
        // second must still dispatch on a fresh cancellation scope.
        let controller = controller_with_script(
            config,
            vec![
                ScriptedReply::completed("too expensive", 11).with_file("x.txt", b"x"),
                ScriptedReply::completed("fits", 1).with_file("y.txt", b"y"),
            ],
        );

        let first = controller.run(request("pricey job", 0.10)).await.unwrap();
        assert_eq!(first.state, SessionState::Aborted);
        assert_eq!(first.abort.unwrap().reason, AbortReason::BudgetExhausted);

        let mut req = request("cheap job", 1.0);
        req.output_name = "second".to_string();
        let second = controller.run(req).await.unwrap();
        assert_eq!(second.state, SessionState::Completed);
        assert_eq!(second.total_cost_cents, 1);
        assert!(second.output_root.join("y.txt").is_file());
    }

    #[tokio::test]
    async fn test_retries_exhausted_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let controller = controller_with_script(
            config,
            vec![
                ScriptedReply::failed("flaky tool", 1),
                ScriptedReply::failed("flaky tool again", 1),
            ],
        );

        let report = controller.run(request("fragile job", 10.0)).await.unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        let abort = report.abort.unwrap();
        assert_eq!(abort.reason, AbortReason::RetriesExhausted);
        // Both failed attempts still spent money.
        assert_eq!(report.total_cost_cents, 2);
        assert!(!report.output_root.exists());
    }

    #[tokio::test]
    async fn test_worker_failure_triggers_one_replan() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let controller = controller_with_script(
            config,
            vec![
                ScriptedReply::failed("first try fails", 1),
                ScriptedReply::completed("second try lands", 2).with_file("out.txt", b"ok"),
            ],
        );

        let report = controller.run(request("retryable job", 10.0)).await.unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.total_cost_cents, 3);

        let events = read_transcript(&report.transcript).await.unwrap();
        let plans = events
            .iter()
            .filter(|e| e.event.name() == "plan_produced")
            .count();
        assert_eq!(plans, 2);
    }

    #[tokio::test]
    async fn test_unknown_tier_is_rejected_before_any_recording() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let controller = controller_with_script(config.clone(), Vec::new());

        let mut req = request("anything", 1.0);
        req.tier = "imaginary".to_string();
        let err = controller.run(req).await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownTier(_)));
        assert!(!config.transcripts_dir.exists());
    }

    #[tokio::test]
    async fn test_replay_reproduces_output_without_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let live = controller_with_script(
            config.clone(),
            vec![ScriptedReply::completed("done", 25).with_file("data.txt", b"payload")],
        );
        let live_report = live.run(request("make data", 5.0)).await.unwrap();
        let recorded = std::fs::read(&live_report.transcript).unwrap();

        // Second controller: replay flag set, a worker that would charge
        // differently if it ever ran.
        let replayer = controller_with_script(
            config,
            vec![ScriptedReply::completed("should never run", 999)],
        );
        let mut req = request("make data", 5.0);
        req.replay = true;
        let replay_report = replayer.run(req).await.unwrap();

        assert_eq!(replay_report.state, SessionState::Replayed);
        assert_eq!(replay_report.exit_code(), 0);
        assert_eq!(replay_report.total_cost_cents, 25);
        assert_eq!(
            std::fs::read(replay_report.output_root.join("data.txt")).unwrap(),
            b"payload"
        );
        // The recording is untouched: replay appends nothing.
        assert_eq!(std::fs::read(&replay_report.transcript).unwrap(), recorded);
    }

    #[tokio::test]
    async fn test_output_conflict_aborts_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(config.outputs_dir.join("result")).unwrap();
        std::fs::write(config.outputs_dir.join("result/data.txt"), b"previous").unwrap();

        let controller = controller_with_script(
            config,
            vec![ScriptedReply::completed("done", 5).with_file("data.txt", b"new")],
        );
        let report = controller.run(request("make data", 5.0)).await.unwrap();
        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(report.abort.unwrap().reason, AbortReason::OutputConflict);
        // Existing content untouched.
        assert_eq!(
            std::fs::read(report.output_root.join("data.txt")).unwrap(),
            b"previous"
        );
    }
}
