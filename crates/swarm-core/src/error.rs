//! Error taxonomy for the orchestration kernel.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state::StoryStatus;

/// Result alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, SwarmError>;

/// Every failure the kernel can surface.
///
/// Most variants are recoverable: the registry renders them as text for the
/// calling worker and the session keeps running.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Another holder owns the file lock. Retry later or pick another target.
    #[error("Lock conflict on {}: held by {holder} since {acquired_at}", path.display())]
    LockConflict {
        path: PathBuf,
        holder: String,
        acquired_at: DateTime<Utc>,
    },

    /// A status change not allowed by the transition table. Ledger unchanged.
    #[error("Transition rejected for {story_id}: {from} -> {to}")]
    TransitionRejected {
        story_id: String,
        from: StoryStatus,
        to: StoryStatus,
    },

    /// An entry whose embedded timestamp predates the session window.
    #[error("Stale entry {id} rejected: created {created_at}, session started {session_start}")]
    StaleDataRejected {
        id: String,
        created_at: DateTime<Utc>,
        session_start: DateTime<Utc>,
    },

    /// Infrastructure-class failure (broken environment, missing dependency).
    #[error("Setup error on {story_id} ({kind}): {message}")]
    SetupError {
        story_id: String,
        kind: String,
        message: String,
    },

    /// Domain-class failure: tests ran and failed.
    #[error("Tests failed for {story_id}: {failed}/{total} failing")]
    TestFailure {
        story_id: String,
        failed: u32,
        total: u32,
    },

    /// Ledger or snapshot I/O failed after exhausting the retry policy.
    #[error("Persistence failed for {} after {attempts} attempts: {reason}", path.display())]
    Persistence {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Story not found: {0}")]
    StoryNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Path escapes project root: {}", .0.display())]
    PathOutsideProject(PathBuf),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SwarmError {
    /// Whether a worker can reasonably retry or choose another action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Persistence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_conflict_message_names_holder() {
        let err = SwarmError::LockConflict {
            path: PathBuf::from("src/a.txt"),
            holder: "coder-1".into(),
            acquired_at: Utc::now(),
        };
        let text = err.to_string();
        assert!(text.contains("src/a.txt"));
        assert!(text.contains("coder-1"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn persistence_is_not_recoverable() {
        let err = SwarmError::Persistence {
            path: PathBuf::from(".swarm/ledger.json"),
            attempts: 5,
            reason: "disk full".into(),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("5 attempts"));
    }
}
