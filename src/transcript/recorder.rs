//! Durable transcript writing and reading.
//!
//! The recorder assigns sequence numbers under a lock and does not return
//! from [`TranscriptRecorder::append`] until the line is written and
//! fsynced. Crashing between any two events therefore loses nothing that
//! the session already acted on.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Result, RunnerError};
use crate::transcript::{SessionEvent, TranscriptEvent};

/// Canonical transcript location for a session identity.
pub fn transcript_path(dir: &Path, identity: &str) -> PathBuf {
    dir.join(format!("{}.jsonl", identity))
}

/// Append-only writer for one session's transcript.
pub struct TranscriptRecorder {
    path: PathBuf,
    inner: Mutex<RecorderInner>,
}

struct RecorderInner {
    file: tokio::fs::File,
    next_seq: u64,
}

impl TranscriptRecorder {
    /// Start a fresh transcript at `path`, creating parent directories.
    ///
    /// A live run always starts from an empty file: the transcript records
    /// this session, and a prior recording of the same identity is only
    /// consulted when replay was requested instead.
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(RecorderInner { file, next_seq: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one event. Returns its sequence number once the line is on
    /// disk.
    pub async fn append(&self, event: SessionEvent) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let entry = TranscriptEvent {
            seq: inner.next_seq,
            at: chrono::Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.sync_all().await?;
        inner.next_seq += 1;
        tracing::trace!(seq = entry.seq, event = entry.event.name(), "transcript event recorded");
        Ok(entry.seq)
    }
}

/// Read a transcript back as parsed events.
///
/// A malformed interior line means the file was damaged and is an error;
/// a malformed *final* line is the signature of a crash mid-append and is
/// dropped, leaving replay to notice the missing terminal event.
pub async fn read_transcript(path: &Path) -> Result<Vec<TranscriptEvent>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = raw.lines().collect();
    let mut events = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptEvent>(line) {
            Ok(event) => events.push(event),
            Err(err) if idx + 1 == lines.len() => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    "dropping partial trailing transcript line: {err}"
                );
            }
            Err(err) => {
                return Err(RunnerError::corrupt_transcript(format!(
                    "{}: malformed event at line {}: {}",
                    path.display(),
                    idx + 1,
                    err
                )));
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use crate::transcript::SessionOutcome;
    use uuid::Uuid;

    fn charge(task_id: Uuid, amount: u64, total: u64) -> SessionEvent {
        SessionEvent::ChargeAccepted {
            task_id,
            amount_cents: amount,
            total_cents: total,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = transcript_path(dir.path(), "abc123");
        let recorder = TranscriptRecorder::create(&path).await.unwrap();

        let id = Uuid::new_v4();
        assert_eq!(recorder.append(charge(id, 10, 10)).await.unwrap(), 0);
        assert_eq!(recorder.append(charge(id, 20, 30)).await.unwrap(), 1);
        assert_eq!(
            recorder
                .append(SessionEvent::SessionTerminated {
                    outcome: SessionOutcome::Completed { total_cost_cents: 30 },
                })
                .await
                .unwrap(),
            2
        );

        let events = read_transcript(&path).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[2].seq, 2);
        assert_eq!(events[2].event.name(), "session_terminated");
    }

    #[tokio::test]
    async fn test_events_visible_before_recorder_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = transcript_path(dir.path(), "durable");
        let recorder = TranscriptRecorder::create(&path).await.unwrap();
        recorder.append(charge(Uuid::new_v4(), 5, 5)).await.unwrap();

        // Read while the recorder is still alive: append already flushed.
        let events = read_transcript(&path).await.unwrap();
        assert_eq!(events.len(), 1);
        drop(recorder);
    }

    #[tokio::test]
    async fn test_malformed_interior_line_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        let recorder = TranscriptRecorder::create(&path).await.unwrap();
        recorder.append(charge(Uuid::new_v4(), 5, 5)).await.unwrap();
        recorder.append(charge(Uuid::new_v4(), 6, 11)).await.unwrap();
        drop(recorder);

        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = raw.lines().map(|l| l.to_string()).collect();
        lines[0] = "{\"seq\":0,\"at\":\"garbage".to_string();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let err = read_transcript(&path).await.unwrap_err();
        assert!(matches!(err, RunnerError::CorruptTranscript(_)));
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.jsonl");
        let recorder = TranscriptRecorder::create(&path).await.unwrap();
        recorder.append(charge(Uuid::new_v4(), 5, 5)).await.unwrap();
        drop(recorder);

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"seq\":1,\"at\":\"2026-01-");
        std::fs::write(&path, raw).unwrap();

        let events = read_transcript(&path).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
