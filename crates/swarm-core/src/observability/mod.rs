//! Observability - session events for subscribers and the event log.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

/// Something that happened in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StoryAssigned {
        story_id: String,
        worker_id: String,
        role: String,
    },
    StoryReadyForTesting {
        story_id: String,
        worker_id: String,
    },
    StoryCompleted {
        story_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },
    StoryFailed {
        story_id: String,
        retry_count: u32,
        reason: String,
    },
    StoryRequeued {
        story_id: String,
        retry_count: u32,
    },
    StoryParked {
        story_id: String,
        remediation_id: String,
    },
    RemediationCreated {
        story_id: String,
        remediation_of: String,
    },
    TransitionRejected {
        story_id: String,
        from: String,
        to: String,
    },
    StaleDataRejected {
        id: String,
    },
    LockConflict {
        path: String,
        holder: String,
        requester: String,
    },
    LockReclaimed {
        path: String,
        previous: String,
        holder: String,
    },
    CheckpointSaved {
        version: u64,
        phase: String,
    },
    SessionStopped {
        locks_released: usize,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoryAssigned { .. } => "story_assigned",
            Self::StoryReadyForTesting { .. } => "story_ready_for_testing",
            Self::StoryCompleted { .. } => "story_completed",
            Self::StoryFailed { .. } => "story_failed",
            Self::StoryRequeued { .. } => "story_requeued",
            Self::StoryParked { .. } => "story_parked",
            Self::RemediationCreated { .. } => "remediation_created",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::StaleDataRejected { .. } => "stale_data_rejected",
            Self::LockConflict { .. } => "lock_conflict",
            Self::LockReclaimed { .. } => "lock_reclaimed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::SessionStopped { .. } => "session_stopped",
        }
    }
}

/// An event as delivered to subscribers and written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Fans events out to in-process subscribers and appends them to a JSONL log.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    sender: broadcast::Sender<EventRecord>,
    log_path: Option<PathBuf>,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, log_path: Option<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            session_id: session_id.into(),
            sender,
            log_path,
        }
    }

    /// Sink with no log file, for tests and embedded use.
    pub fn in_memory(session_id: impl Into<String>) -> Self {
        Self::new(session_id, None)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Emit an event. Log failures are reported but never propagate.
    pub fn emit(&self, event: SessionEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            event,
        };
        if let Some(path) = &self.log_path {
            if let Err(e) = append_record(path, &record) {
                warn!(path = %path.display(), error = %e, "Failed to append event");
            }
        }
        // No subscribers is fine.
        let _ = self.sender.send(record);
    }
}

fn append_record(path: &Path, record: &EventRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Read the last `limit` events from a log file.
pub fn read_recent(path: &Path, limit: usize) -> Vec<EventRecord> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let reader = BufReader::new(file);
    let mut events: Vec<EventRecord> = reader
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| serde_json::from_str(&line).ok())
        .collect();

    if events.len() > limit {
        events.drain(0..events.len() - limit);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let sink = EventSink::in_memory("s1");
        let mut rx = sink.subscribe();
        sink.emit(SessionEvent::StoryRequeued {
            story_id: "S1".into(),
            retry_count: 1,
        });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.event.kind(), "story_requeued");
    }

    #[test]
    fn log_keeps_the_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".swarm/events.jsonl");
        let sink = EventSink::new("s1", Some(path.clone()));
        for n in 0..5 {
            sink.emit(SessionEvent::CheckpointSaved {
                version: n,
                phase: "in_progress".into(),
            });
        }

        let recent = read_recent(&path, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(
            recent[1].event,
            SessionEvent::CheckpointSaved {
                version: 4,
                phase: "in_progress".into()
            }
        );

        let line = std::fs::read_to_string(&path).unwrap();
        assert!(line.lines().next().unwrap().contains("\"type\":\"checkpoint_saved\""));
    }

    #[test]
    fn missing_log_reads_empty() {
        assert!(read_recent(Path::new("/nonexistent/events.jsonl"), 10).is_empty());
    }
}
