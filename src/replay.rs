//! Replay: rebuild a finished session from its transcript alone.
//!
//! The fold is pure. It dispatches no workers, opens no ledger, and spends
//! nothing; every fact it returns was read from the event stream. Because
//! completed tasks embed their artifact fragments, the rebuilt
//! [`ArtifactSet`] is byte-for-byte the one the original session wrote.
//!
//! Any structural or semantic damage (a sequence gap, a missing terminal
//! event, charges that disagree with their running total, an event naming
//! a task no plan introduced) fails the whole replay with
//! `CorruptTranscript`. A damaged record is worse than no record.

use std::collections::HashSet;

use uuid::Uuid;

use crate::artifact::ArtifactSet;
use crate::budget::usd_to_cents;
use crate::error::{Result, RunnerError};
use crate::session::SessionRequest;
use crate::transcript::{SessionEvent, SessionOutcome, TranscriptEvent};

/// Everything a transcript proves about a finished session.
#[derive(Debug, Clone)]
pub struct ReplayedSession {
    pub session_id: Uuid,
    pub identity: String,
    pub request: SessionRequest,
    pub outcome: SessionOutcome,
    pub artifacts: ArtifactSet,
    pub total_cost_cents: u64,
}

/// Fold a transcript into the session it records.
pub fn replay(events: &[TranscriptEvent]) -> Result<ReplayedSession> {
    if events.is_empty() {
        return Err(RunnerError::corrupt_transcript("transcript is empty"));
    }

    let mut started: Option<(Uuid, String, SessionRequest)> = None;
    let mut outcome: Option<SessionOutcome> = None;
    let mut artifacts = ArtifactSet::new();
    let mut total_cents = 0u64;
    let mut known_tasks: HashSet<Uuid> = HashSet::new();

    for (idx, entry) in events.iter().enumerate() {
        if entry.seq != idx as u64 {
            return Err(RunnerError::corrupt_transcript(format!(
                "sequence break: expected {} but found {}",
                idx, entry.seq
            )));
        }
        if outcome.is_some() {
            return Err(RunnerError::corrupt_transcript(format!(
                "event at seq {} follows session_terminated",
                entry.seq
            )));
        }
        if idx > 0 && started.is_none() {
            return Err(RunnerError::corrupt_transcript(
                "transcript does not begin with session_started",
            ));
        }

        match &entry.event {
            SessionEvent::SessionStarted {
                session_id,
                identity,
                request,
            } => {
                if idx != 0 {
                    return Err(RunnerError::corrupt_transcript(format!(
                        "second session_started at seq {}",
                        entry.seq
                    )));
                }
                started = Some((*session_id, identity.clone(), request.clone()));
            }
            SessionEvent::PlanProduced { tasks, .. } => {
                known_tasks.extend(tasks.iter().map(|t| t.id));
            }
            SessionEvent::TaskDispatched { task_id, .. } => {
                require_known(&known_tasks, *task_id, entry.seq)?;
            }
            SessionEvent::ChargeAccepted {
                task_id,
                amount_cents,
                total_cents: recorded_total,
            } => {
                require_known(&known_tasks, *task_id, entry.seq)?;
                total_cents = total_cents.checked_add(*amount_cents).ok_or_else(|| {
                    RunnerError::corrupt_transcript(format!(
                        "charge amounts overflow at seq {}",
                        entry.seq
                    ))
                })?;
                if *recorded_total != total_cents {
                    return Err(RunnerError::corrupt_transcript(format!(
                        "ledger total mismatch at seq {}: recorded {} but charges sum to {}",
                        entry.seq, recorded_total, total_cents
                    )));
                }
            }
            SessionEvent::ChargeRejected { task_id, .. } => {
                require_known(&known_tasks, *task_id, entry.seq)?;
            }
            SessionEvent::TaskCompleted { outcome: task } => {
                require_known(&known_tasks, task.task_id, entry.seq)?;
                for fragment in &task.fragments {
                    artifacts
                        .insert_fragment(fragment)
                        .map_err(|reason| {
                            RunnerError::corrupt_transcript(format!("seq {}: {}", entry.seq, reason))
                        })?;
                }
            }
            SessionEvent::TaskFailed { failure } => {
                require_known(&known_tasks, failure.task_id, entry.seq)?;
            }
            SessionEvent::ArtifactsMaterialized { .. } => {}
            SessionEvent::SessionTerminated { outcome: terminal } => {
                outcome = Some(terminal.clone());
            }
        }
    }

    let (session_id, identity, request) = started
        .ok_or_else(|| RunnerError::corrupt_transcript("transcript does not begin with session_started"))?;
    let outcome = outcome
        .ok_or_else(|| RunnerError::corrupt_transcript("transcript ends before session_terminated"))?;

    if let SessionOutcome::Completed { total_cost_cents } = &outcome {
        if *total_cost_cents != total_cents {
            return Err(RunnerError::corrupt_transcript(format!(
                "terminal event claims {} cents but charges sum to {}",
                total_cost_cents, total_cents
            )));
        }
    }
    let cap_cents = usd_to_cents(request.limit_usd);
    if total_cents > cap_cents {
        return Err(RunnerError::corrupt_transcript(format!(
            "recorded charges ({} cents) exceed the session cap ({} cents)",
            total_cents, cap_cents
        )));
    }

    tracing::info!(
        session_id = %session_id,
        identity = %identity,
        events = events.len(),
        total_cost_cents = total_cents,
        files = artifacts.len(),
        "transcript replayed"
    );

    Ok(ReplayedSession {
        session_id,
        identity,
        request,
        outcome,
        artifacts,
        total_cost_cents: total_cents,
    })
}

fn require_known(known: &HashSet<Uuid>, task_id: Uuid, seq: u64) -> Result<()> {
    if known.contains(&task_id) {
        Ok(())
    } else {
        Err(RunnerError::corrupt_transcript(format!(
            "seq {} references task {} which no plan introduced",
            seq, task_id
        )))
    }
}
