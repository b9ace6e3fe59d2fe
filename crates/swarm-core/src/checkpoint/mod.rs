//! Checkpoints - versioned snapshots of ledger and scheduler state.
//!
//! Every save writes `checkpoint-<version>.json` plus a `latest.json` copy.
//! Snapshots are never modified after they are written.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fsutil;
use crate::kernel::SchedulerState;
use crate::state::{Epic, Story, StoryStatus};

const LATEST: &str = "latest.json";
const PREFIX: &str = "checkpoint-";

/// Coarse session phase, derived from story statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Planning,
    InProgress,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Finalize => "finalize",
        }
    }
}

/// Phase for a set of stories.
pub fn derive_phase(stories: &[Story]) -> Phase {
    if stories.is_empty() {
        Phase::Planning
    } else if stories.iter().all(|s| s.status.is_terminal()) {
        Phase::Finalize
    } else if stories.iter().any(|s| s.status != StoryStatus::Backlog) {
        Phase::InProgress
    } else {
        Phase::Planning
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub epics: Vec<Epic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u64,
    pub session_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub ledger: LedgerSnapshot,
    #[serde(default)]
    pub scheduler: SchedulerState,
}

impl Checkpoint {
    /// Stories to resume with: done stories unchanged, everything else back
    /// to an unassigned backlog entry.
    pub fn restored_stories(&self) -> Vec<Story> {
        self.ledger.stories.iter().cloned().map(reset_in_flight).collect()
    }
}

/// Put a non-terminal story back in the backlog, unassigned. Done stories are
/// returned unchanged.
pub fn reset_in_flight(mut story: Story) -> Story {
    if !story.status.is_terminal() {
        story.status = StoryStatus::Backlog;
        story.assigned_worker_id = None;
    }
    story
}

/// Directory of checkpoint files for one project.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{version}.json"))
    }

    /// Write a new snapshot with the next version number.
    pub async fn save(
        &self,
        session_id: &str,
        project_id: &str,
        stories: &[Story],
        epics: &[Epic],
        scheduler: SchedulerState,
    ) -> Result<Checkpoint> {
        fs::create_dir_all(&self.dir).await?;
        let version = self.list().await?.last().map_or(1, |v| v + 1);

        let checkpoint = Checkpoint {
            version,
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
            phase: derive_phase(stories),
            ledger: LedgerSnapshot {
                stories: stories.to_vec(),
                epics: epics.to_vec(),
            },
            scheduler,
        };

        fsutil::atomic_write_json(&self.file_for(version), &checkpoint)?;
        fsutil::atomic_write_json(&self.dir.join(LATEST), &checkpoint)?;

        info!(
            version,
            session_id,
            phase = checkpoint.phase.as_str(),
            stories = stories.len(),
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Most recent snapshot. Falls back to the highest versioned file when
    /// `latest.json` is missing or unreadable.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        match read_checkpoint(&self.dir.join(LATEST)).await {
            Some(checkpoint) => return Ok(Some(checkpoint)),
            None => debug!(dir = %self.dir.display(), "No usable latest checkpoint, scanning versions"),
        }

        for version in self.list().await?.into_iter().rev() {
            if let Some(checkpoint) = read_checkpoint(&self.file_for(version)).await {
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    pub async fn load_version(&self, version: u64) -> Result<Option<Checkpoint>> {
        Ok(read_checkpoint(&self.file_for(version)).await)
    }

    /// Available versions, ascending.
    pub async fn list(&self) -> Result<Vec<u64>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(version) = name
                .strip_prefix(PREFIX)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|v| v.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Delete all but the newest `keep` versioned files. `latest.json` stays.
    pub async fn prune(&self, keep: usize) -> Result<Vec<u64>> {
        let versions = self.list().await?;
        let cut = versions.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for version in versions.into_iter().take(cut) {
            match fs::remove_file(self.file_for(version)).await {
                Ok(()) => removed.push(version),
                Err(e) => warn!(version, error = %e, "Failed to prune checkpoint"),
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), kept = keep, "Pruned checkpoints");
        }
        Ok(removed)
    }
}

async fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
    let content = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable checkpoint");
            None
        }
    }
}
