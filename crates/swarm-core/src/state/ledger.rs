//! Task ledger - the durable record of stories and epics.
//!
//! The ledger file is the one resource shared with out-of-process workers, so
//! every read and write goes through an advisory lock file with the configured
//! retry policy. In memory the ledger is an authoritative cache that is
//! reconciled with disk by [`TaskLedger::sync_external`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::archive::ArchiveStore;
use super::story::{Epic, Story, StoryStatus};
use super::transition;
use crate::config::{RetryPolicy, SwarmConfig};
use crate::error::{Result, SwarmError};
use crate::fsutil::{self, AdvisoryLock, LockAttempt};

/// On-disk ledger shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerFile {
    #[serde(default)]
    pub tasks: Vec<Story>,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// What a read of the ledger file found.
#[derive(Debug)]
enum ReadOutcome {
    Missing,
    Corrupt(String),
    Parsed(LedgerFile, Option<SystemTime>),
}

/// Result of merging an externally modified ledger file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// File unchanged since the last read; nothing parsed
    pub unchanged: bool,
    /// Existing stories updated from disk
    pub applied: Vec<String>,
    /// New stories ingested
    pub added: Vec<String>,
    /// Existing stories whose on-disk status change was illegal
    pub rejected: Vec<String>,
    /// New stories refused by the stale-insertion guard
    pub stale: Vec<String>,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        !self.applied.is_empty() || !self.added.is_empty()
    }
}

/// Result of an archive pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: Vec<String>,
    pub retained: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub active: usize,
    pub archived: usize,
    pub total: usize,
}

/// The narrow interface the scheduler and tool handlers mutate stories
/// through. Callers never touch ledger storage directly.
pub trait StoryStore {
    fn story(&self, id: &str) -> Option<&Story>;

    fn stories(&self) -> &[Story];

    /// Done stories, including archived ones.
    fn is_done(&self, id: &str) -> bool;

    fn insert_story(&mut self, story: Story) -> Result<()>;

    /// Validated status change. `edit` runs after the status is set and may
    /// adjust assignment and bookkeeping fields.
    fn transition<F>(&mut self, id: &str, to: StoryStatus, edit: F) -> Result<&Story>
    where
        F: FnOnce(&mut Story);

    /// Change non-status fields.
    fn update_story<F>(&mut self, id: &str, edit: F) -> Result<&Story>
    where
        F: FnOnce(&mut Story);
}

/// Authoritative record of stories and epics, backed by a JSON file.
#[derive(Debug)]
pub struct TaskLedger {
    path: PathBuf,
    lock_path: PathBuf,
    stories: Vec<Story>,
    epics: Vec<Epic>,
    archive: ArchiveStore,
    policy: RetryPolicy,
    lock_stale_after: Duration,
    session_start: DateTime<Utc>,
    stale_tolerance: chrono::Duration,
    last_mtime: Option<SystemTime>,
}

impl TaskLedger {
    /// Create an empty in-memory ledger bound to the configured files.
    pub fn new(config: &SwarmConfig, session_start: DateTime<Utc>) -> Self {
        let mut lock_name = config.ledger_path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path: config.ledger_path.clone(),
            lock_path: PathBuf::from(lock_name),
            stories: Vec::new(),
            epics: Vec::new(),
            archive: ArchiveStore::new(&config.archive_path),
            policy: config.persistence,
            lock_stale_after: config.locks.stale_after(),
            session_start,
            stale_tolerance: config.stale_insertion_tolerance(),
            last_mtime: None,
        }
    }

    /// Create and load from disk.
    pub async fn open(config: &SwarmConfig, session_start: DateTime<Utc>) -> Result<Self> {
        let mut ledger = Self::new(config, session_start);
        ledger.load().await?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn epics(&self) -> &[Epic] {
        &self.epics
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    /// Whether the ledger file currently exists on disk.
    pub fn file_exists(&self) -> bool {
        self.path.exists()
    }

    /// Replace the in-memory contents (used when restoring a checkpoint).
    pub fn replace_contents(&mut self, stories: Vec<Story>, epics: Vec<Epic>) {
        self.stories = stories
            .into_iter()
            .filter(|s| !self.archive.contains(&s.id))
            .collect();
        self.epics = epics;
        self.refresh_epics();
    }

    /// Read the ledger and archive from disk, replacing in-memory state.
    ///
    /// A corrupt ledger file is treated as empty with a warning.
    pub async fn load(&mut self) -> Result<()> {
        let path = self.path.clone();
        let archive_path = self.archive.path().to_path_buf();
        let (outcome, archive) = self
            .guarded(&path, || {
                let outcome = read_ledger_file(&path)?;
                let archive = ArchiveStore::read(&archive_path)?;
                Ok((outcome, archive))
            })
            .await?;

        self.archive.replace(archive);
        match outcome {
            ReadOutcome::Missing => {
                debug!(path = %self.path.display(), "No ledger file, starting empty");
                self.stories.clear();
                self.epics.clear();
                self.last_mtime = None;
            }
            ReadOutcome::Corrupt(reason) => {
                warn!(path = %self.path.display(), error = %reason, "Ledger file is corrupt, treating as empty");
                self.stories.clear();
                self.epics.clear();
                self.last_mtime = fsutil::modified_time(&self.path);
            }
            ReadOutcome::Parsed(file, mtime) => {
                self.stories = dedupe(file.tasks)
                    .into_iter()
                    .filter(|s| !self.archive.contains(&s.id))
                    .collect();
                self.epics = file.epics;
                self.last_mtime = mtime;
                info!(
                    path = %self.path.display(),
                    stories = self.stories.len(),
                    epics = self.epics.len(),
                    "Ledger loaded"
                );
            }
        }
        Ok(())
    }

    /// Write the ledger atomically under the advisory lock.
    pub async fn persist(&mut self) -> Result<()> {
        let file = LedgerFile {
            tasks: self.stories.clone(),
            epics: self.epics.clone(),
            last_updated: Some(Utc::now()),
        };
        let path = self.path.clone();
        let mtime = self
            .guarded(&path, || {
                fsutil::atomic_write_json(&path, &file)?;
                Ok(fsutil::modified_time(&path))
            })
            .await?;
        self.last_mtime = mtime;
        debug!(path = %self.path.display(), stories = file.tasks.len(), "Ledger persisted");
        Ok(())
    }

    /// Merge changes other processes wrote to the ledger file.
    ///
    /// Status changes are checked against the transition table and illegal
    /// ones dropped. Unknown ids whose embedded timestamp predates the session
    /// by more than the skew tolerance are refused.
    pub async fn sync_external(&mut self) -> Result<SyncReport> {
        let current = fsutil::modified_time(&self.path);
        if current.is_some() && current == self.last_mtime {
            return Ok(SyncReport {
                unchanged: true,
                ..SyncReport::default()
            });
        }

        let path = self.path.clone();
        let outcome = self.guarded(&path, || read_ledger_file(&path)).await?;

        let mut report = SyncReport::default();
        let (file, mtime) = match outcome {
            ReadOutcome::Missing => {
                if self.last_mtime.is_some() {
                    warn!(path = %self.path.display(), "Ledger file disappeared, keeping in-memory state");
                    self.last_mtime = None;
                }
                report.unchanged = true;
                return Ok(report);
            }
            ReadOutcome::Corrupt(reason) => {
                warn!(path = %self.path.display(), error = %reason, "External ledger is corrupt, ignoring");
                self.last_mtime = current;
                report.unchanged = true;
                return Ok(report);
            }
            ReadOutcome::Parsed(file, mtime) => (file, mtime),
        };

        for external in dedupe(file.tasks) {
            self.merge_external(external, &mut report);
        }

        for epic in file.epics {
            match self.epics.iter_mut().find(|e| e.id == epic.id) {
                Some(existing) => *existing = epic,
                None => self.epics.push(epic),
            }
        }
        self.refresh_epics();
        self.last_mtime = mtime;

        if report.has_changes() || !report.rejected.is_empty() {
            info!(
                applied = report.applied.len(),
                added = report.added.len(),
                rejected = report.rejected.len(),
                stale = report.stale.len(),
                "Merged external ledger changes"
            );
        }
        Ok(report)
    }

    fn merge_external(&mut self, mut external: Story, report: &mut SyncReport) {
        if let Some(current) = self.stories.iter_mut().find(|s| s.id == external.id) {
            if *current == external {
                return;
            }
            if !transition::is_legal(current.status, external.status) {
                warn!(
                    story_id = %external.id,
                    from = %current.status,
                    to = %external.status,
                    "Dropping illegal external transition"
                );
                report.rejected.push(external.id);
                return;
            }
            if !external.status.is_claimed() {
                external.assigned_worker_id = None;
            } else if external.assigned_worker_id.is_none() {
                external.assigned_worker_id = current.assigned_worker_id.clone();
                if external.assigned_worker_id.is_none() {
                    warn!(story_id = %external.id, status = %external.status, "External claim without a worker, ignoring");
                    report.rejected.push(external.id);
                    return;
                }
            }
            report.applied.push(external.id.clone());
            *current = external;
            return;
        }

        if self.archive.contains(&external.id) {
            return;
        }

        if let Err(e) = self.check_fresh(&external) {
            debug!(error = %e, "Skipping stale external story");
            report.stale.push(external.id);
            return;
        }

        if !external.status.is_claimed() {
            external.assigned_worker_id = None;
        } else if external.assigned_worker_id.is_none() {
            external.status = StoryStatus::Backlog;
        }
        report.added.push(external.id.clone());
        self.stories.push(external);
    }

    /// Stale-insertion guard.
    pub fn check_fresh(&self, story: &Story) -> Result<()> {
        match story.id_timestamp() {
            Some(created_at) if created_at < self.session_start - self.stale_tolerance => {
                Err(SwarmError::StaleDataRejected {
                    id: story.id.clone(),
                    created_at,
                    session_start: self.session_start,
                })
            }
            _ => Ok(()),
        }
    }

    /// Move terminal stories into the archive, keeping the `keep_recent` most
    /// recently completed ones active. Safe to call repeatedly.
    pub async fn archive_terminal(&mut self, keep_recent: usize) -> Result<ArchiveReport> {
        let mut terminal: Vec<(usize, Option<DateTime<Utc>>)> = self
            .stories
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(i, s)| (i, s.completed_at))
            .collect();
        // Most recent first; position breaks ties so later entries count as newer.
        terminal.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

        let retained = terminal.len().min(keep_recent);
        let mut move_idx: Vec<usize> = terminal.iter().skip(keep_recent).map(|(i, _)| *i).collect();
        if move_idx.is_empty() {
            return Ok(ArchiveReport {
                archived: Vec::new(),
                retained,
            });
        }
        move_idx.sort_unstable();

        // Stage the move on a copy; memory only changes once the archive is on disk.
        let now = Utc::now();
        let mut staged = self.archive.clone();
        let mut report = ArchiveReport {
            archived: Vec::new(),
            retained,
        };
        for &idx in &move_idx {
            let story = self.stories[idx].clone();
            let id = story.id.clone();
            if staged.append(story, now) {
                report.archived.push(id);
            }
        }

        let archive_path = staged.path().to_path_buf();
        self.guarded(&archive_path, || staged.write()).await?;

        let moved: HashSet<usize> = move_idx.into_iter().collect();
        let mut position = 0;
        self.stories.retain(|_| {
            let keep = !moved.contains(&position);
            position += 1;
            keep
        });
        self.archive = staged;
        self.persist().await?;

        info!(
            archived = report.archived.len(),
            retained = report.retained,
            "Archived terminal stories"
        );
        Ok(report)
    }

    pub fn counts(&self) -> LedgerCounts {
        let active = self.stories.len();
        let archived = self.archive.len();
        let mut ids: std::collections::HashSet<&str> =
            self.stories.iter().map(|s| s.id.as_str()).collect();
        ids.extend(self.archive.stories().iter().map(|s| s.id.as_str()));
        LedgerCounts {
            active,
            archived,
            total: ids.len(),
        }
    }

    /// Insert or replace an epic and recompute its status.
    pub fn upsert_epic(&mut self, epic: Epic) {
        match self.epics.iter_mut().find(|e| e.id == epic.id) {
            Some(existing) => *existing = epic,
            None => self.epics.push(epic),
        }
        self.refresh_epics();
    }

    pub fn epic(&self, id: &str) -> Option<&Epic> {
        self.epics.iter().find(|e| e.id == id)
    }

    /// Epic status follows its children: done when all are done, in progress
    /// once any has started.
    fn refresh_epics(&mut self) {
        let stories = &self.stories;
        let archive = &self.archive;
        for epic in &mut self.epics {
            if epic.story_ids.is_empty() {
                continue;
            }
            let statuses: Vec<StoryStatus> = epic
                .story_ids
                .iter()
                .map(|id| {
                    stories
                        .iter()
                        .find(|s| &s.id == id)
                        .map(|s| s.status)
                        .or_else(|| archive.get(id).map(|s| s.status))
                        .unwrap_or(StoryStatus::Backlog)
                })
                .collect();
            epic.status = if statuses.iter().all(|s| s.is_terminal()) {
                StoryStatus::Done
            } else if statuses.iter().any(|s| *s != StoryStatus::Backlog) {
                StoryStatus::InProgress
            } else {
                StoryStatus::Backlog
            };
        }
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.stories
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SwarmError::StoryNotFound(id.to_string()))
    }

    /// Run `op` on `target` while holding the ledger lock file, retrying per
    /// policy.
    async fn guarded<T, F>(&self, target: &Path, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let holder = format!("ledger:{}", std::process::id());
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match AdvisoryLock::try_acquire(&self.lock_path, &holder, self.lock_stale_after) {
                Ok(LockAttempt::Acquired(lock)) => {
                    let result = op();
                    lock.release();
                    match result {
                        Ok(value) => return Ok(value),
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Ok(LockAttempt::Held(info)) => {
                    last_error = match info {
                        Some(info) => format!("ledger locked by {} (pid {})", info.holder, info.pid),
                        None => "ledger locked".to_string(),
                    };
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < attempts {
                let delay = self.policy.backoff(attempt);
                warn!(
                    path = %target.display(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Ledger access failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(path = %target.display(), attempts, error = %last_error, "Ledger access failed");
        Err(SwarmError::Persistence {
            path: target.to_path_buf(),
            attempts,
            reason: last_error,
        })
    }
}

impl StoryStore for TaskLedger {
    fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    fn stories(&self) -> &[Story] {
        &self.stories
    }

    fn is_done(&self, id: &str) -> bool {
        match self.story(id) {
            Some(story) => story.status.is_terminal(),
            None => self.archive.get(id).is_some_and(|s| s.status.is_terminal()),
        }
    }

    fn insert_story(&mut self, story: Story) -> Result<()> {
        if self.story(&story.id).is_some() || self.archive.contains(&story.id) {
            return Err(SwarmError::InvalidInput(format!("Story {} already exists", story.id)));
        }
        self.check_fresh(&story)?;
        info!(story_id = %story.id, title = %story.title, priority = ?story.priority, "Story added");
        if let Some(epic_id) = &story.epic_id {
            if let Some(epic) = self.epics.iter_mut().find(|e| &e.id == epic_id) {
                if !epic.story_ids.contains(&story.id) {
                    epic.story_ids.push(story.id.clone());
                }
            }
        }
        self.stories.push(story);
        self.refresh_epics();
        Ok(())
    }

    fn transition<F>(&mut self, id: &str, to: StoryStatus, edit: F) -> Result<&Story>
    where
        F: FnOnce(&mut Story),
    {
        let idx = self.position(id)?;
        let from = self.stories[idx].status;
        if from == to || !transition::is_legal(from, to) {
            warn!(story_id = %id, from = %from, to = %to, "Transition rejected");
            return Err(SwarmError::TransitionRejected {
                story_id: id.to_string(),
                from,
                to,
            });
        }

        let story = &mut self.stories[idx];
        story.status = to;
        edit(story);
        if !to.is_claimed() {
            story.assigned_worker_id = None;
        }
        if to.is_terminal() && story.completed_at.is_none() {
            story.completed_at = Some(Utc::now());
        }
        debug_assert_eq!(story.status.is_claimed(), story.assigned_worker_id.is_some());
        info!(
            story_id = %id,
            from = %from,
            to = %to,
            worker_id = story.assigned_worker_id.as_deref().unwrap_or("-"),
            "Story transition"
        );

        self.refresh_epics();
        Ok(&self.stories[idx])
    }

    fn update_story<F>(&mut self, id: &str, edit: F) -> Result<&Story>
    where
        F: FnOnce(&mut Story),
    {
        let idx = self.position(id)?;
        let status = self.stories[idx].status;
        let story = &mut self.stories[idx];
        edit(story);
        // Status only changes through `transition`.
        story.status = status;
        Ok(&self.stories[idx])
    }
}

fn read_ledger_file(path: &Path) -> Result<ReadOutcome> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
        Err(e) => return Err(e.into()),
    };
    let mtime = fsutil::modified_time(path);
    if content.trim().is_empty() {
        return Ok(ReadOutcome::Parsed(LedgerFile::default(), mtime));
    }
    match serde_json::from_str::<LedgerFile>(&content) {
        Ok(file) => Ok(ReadOutcome::Parsed(file, mtime)),
        Err(e) => Ok(ReadOutcome::Corrupt(e.to_string())),
    }
}

/// Keep the last occurrence of each id, preserving first-seen order.
fn dedupe(stories: Vec<Story>) -> Vec<Story> {
    let mut out: Vec<Story> = Vec::with_capacity(stories.len());
    for story in stories {
        match out.iter_mut().find(|s| s.id == story.id) {
            Some(existing) => *existing = story,
            None => out.push(story),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::story::Priority;

    fn config(dir: &Path) -> SwarmConfig {
        let mut config = SwarmConfig::for_project(dir);
        config.persistence = RetryPolicy::no_retry();
        config
    }

    fn write_external(path: &Path, stories: &[Story]) {
        let file = LedgerFile {
            tasks: stories.to_vec(),
            epics: vec![],
            last_updated: Some(Utc::now()),
        };
        // Make sure the mtime moves even on coarse filesystems.
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(path, serde_json::to_vec(&file).unwrap()).unwrap();
        let later = SystemTime::now() + Duration::from_secs(2);
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(later).unwrap();
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TaskLedger::open(&config(dir.path()), Utc::now()).await.unwrap();
        assert!(ledger.stories().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(config.ledger_path.parent().unwrap()).unwrap();
        std::fs::write(&config.ledger_path, "{\"tasks\": [oops").unwrap();

        let ledger = TaskLedger::open(&config, Utc::now()).await.unwrap();
        assert!(ledger.stories().is_empty());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut ledger = TaskLedger::new(&config, Utc::now());
        ledger
            .insert_story(Story::with_id("S1", "Login").priority(Priority::High))
            .unwrap();
        ledger.persist().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config.ledger_path).unwrap()).unwrap();
        assert!(raw.get("lastUpdated").is_some());
        assert_eq!(raw["tasks"][0]["id"], "S1");

        let reloaded = TaskLedger::open(&config, Utc::now()).await.unwrap();
        assert_eq!(reloaded.story("S1").unwrap().priority, Priority::High);
    }

    #[tokio::test]
    async fn persist_fails_while_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut ledger = TaskLedger::new(&config, Utc::now());
        let _held = AdvisoryLock::try_acquire(&ledger.lock_path, "other", Duration::from_secs(60)).unwrap();

        let err = ledger.persist().await.unwrap_err();
        assert!(matches!(err, SwarmError::Persistence { attempts: 1, .. }));
        // In-memory state keeps working.
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();
        assert!(ledger.story("S1").is_some());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_state_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::new(&config(dir.path()), Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();

        let err = ledger.transition("S1", StoryStatus::Testing, |_| {}).unwrap_err();
        assert!(matches!(err, SwarmError::TransitionRejected { .. }));
        assert_eq!(ledger.story("S1").unwrap().status, StoryStatus::Backlog);
    }

    #[tokio::test]
    async fn sync_drops_regression_from_testing_to_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut ledger = TaskLedger::new(&config, Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();
        ledger
            .transition("S1", StoryStatus::InProgress, |s| s.assigned_worker_id = Some("coder-1".into()))
            .unwrap();
        ledger.transition("S1", StoryStatus::Testing, |_| {}).unwrap();
        ledger.persist().await.unwrap();

        let mut regressed = ledger.story("S1").unwrap().clone();
        regressed.status = StoryStatus::Backlog;
        regressed.assigned_worker_id = None;
        write_external(&config.ledger_path, &[regressed]);

        let report = ledger.sync_external().await.unwrap();
        assert_eq!(report.rejected, vec!["S1".to_string()]);
        assert_eq!(ledger.story("S1").unwrap().status, StoryStatus::Testing);
    }

    #[tokio::test]
    async fn sync_applies_forward_transition_and_new_stories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut ledger = TaskLedger::new(&config, Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();
        ledger.persist().await.unwrap();

        let mut done = ledger.story("S1").unwrap().clone();
        done.status = StoryStatus::Done;
        write_external(&config.ledger_path, &[done, Story::new("Fresh work")]);

        let report = ledger.sync_external().await.unwrap();
        assert_eq!(report.applied, vec!["S1".to_string()]);
        assert_eq!(report.added.len(), 1);
        assert!(ledger.is_done("S1"));

        let again = ledger.sync_external().await.unwrap();
        assert!(again.unchanged);
    }

    #[tokio::test]
    async fn sync_refuses_stories_older_than_session_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let session_start = Utc::now();
        let mut ledger = TaskLedger::new(&config, session_start);
        ledger.persist().await.unwrap();

        let old = session_start - chrono::Duration::hours(2);
        let recent = session_start - chrono::Duration::minutes(30);
        let stale = Story::with_id(format!("story-{}-aaaa", old.timestamp_millis()), "old");
        let skewed = Story::with_id(format!("story-{}-bbbb", recent.timestamp_millis()), "skew");
        write_external(&config.ledger_path, &[stale.clone(), skewed.clone()]);

        let report = ledger.sync_external().await.unwrap();
        assert_eq!(report.stale, vec![stale.id.clone()]);
        assert_eq!(report.added, vec![skewed.id.clone()]);
        assert!(ledger.story(&stale.id).is_none());
    }

    #[tokio::test]
    async fn archive_is_idempotent_and_counts_balance() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::new(&config(dir.path()), Utc::now());
        for id in ["S1", "S2", "S3"] {
            ledger.insert_story(Story::with_id(id, id)).unwrap();
            ledger.transition(id, StoryStatus::Done, |_| {}).unwrap();
        }
        ledger.insert_story(Story::with_id("S4", "open")).unwrap();

        let first = ledger.archive_terminal(1).await.unwrap();
        assert_eq!(first.archived.len(), 2);
        assert_eq!(first.retained, 1);
        let counts = ledger.counts();
        assert_eq!(counts.active + counts.archived, counts.total);
        assert_eq!(counts.total, 4);

        let second = ledger.archive_terminal(1).await.unwrap();
        assert!(second.archived.is_empty());
        assert_eq!(ledger.counts(), counts);

        ledger.archive_terminal(0).await.unwrap();
        let counts = ledger.counts();
        assert_eq!((counts.active, counts.archived, counts.total), (1, 3, 4));
        assert!(ledger.is_done("S1"));
    }

    #[tokio::test]
    async fn archived_ids_are_not_reinserted() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::new(&config(dir.path()), Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();
        ledger.transition("S1", StoryStatus::Done, |_| {}).unwrap();
        ledger.archive_terminal(0).await.unwrap();

        assert!(ledger.insert_story(Story::with_id("S1", "again")).is_err());
    }

    #[tokio::test]
    async fn failed_archive_write_keeps_stories_active() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(&config.archive_path).unwrap();
        let mut ledger = TaskLedger::new(&config, Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();
        ledger.transition("S1", StoryStatus::Done, |_| {}).unwrap();

        let err = ledger.archive_terminal(0).await.unwrap_err();
        let SwarmError::Persistence { path, .. } = err else {
            panic!("expected persistence error, got {err:?}");
        };
        assert_eq!(path, config.archive_path);
        assert!(ledger.story("S1").is_some());
        assert!(ledger.archive().is_empty());

        ledger.insert_story(Story::with_id("S2", "y")).unwrap();
        ledger.persist().await.unwrap();
        std::fs::remove_dir(&config.archive_path).unwrap();

        let reopened = TaskLedger::open(&config, Utc::now()).await.unwrap();
        assert!(reopened.story("S1").is_some());
        let counts = reopened.counts();
        assert_eq!((counts.active, counts.archived, counts.total), (2, 0, 2));
    }

    #[tokio::test]
    async fn persist_waits_out_a_briefly_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwarmConfig::for_project(dir.path());
        config.persistence = RetryPolicy::default();
        let mut ledger = TaskLedger::new(&config, Utc::now());
        ledger.insert_story(Story::with_id("S1", "x")).unwrap();

        let LockAttempt::Acquired(held) =
            AdvisoryLock::try_acquire(&ledger.lock_path, "other-process", Duration::from_secs(30)).unwrap()
        else {
            panic!("lock file should be free");
        };
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held);
        });

        let started = std::time::Instant::now();
        ledger.persist().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        releaser.await.unwrap();

        let on_disk: LedgerFile =
            serde_json::from_str(&std::fs::read_to_string(&config.ledger_path).unwrap()).unwrap();
        assert_eq!(on_disk.tasks.len(), 1);
        assert!(!ledger.lock_path.exists());
    }

    #[test]
    fn epic_status_rolls_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TaskLedger::new(&config(dir.path()), Utc::now());
        let mut epic = Epic::new("E1", "Auth");
        epic.story_ids = vec!["S1".into(), "S2".into()];
        ledger.upsert_epic(epic);
        ledger.insert_story(Story::with_id("S1", "a")).unwrap();
        ledger.insert_story(Story::with_id("S2", "b")).unwrap();
        assert_eq!(ledger.epic("E1").unwrap().status, StoryStatus::Backlog);

        ledger.transition("S1", StoryStatus::Done, |_| {}).unwrap();
        assert_eq!(ledger.epic("E1").unwrap().status, StoryStatus::InProgress);
        ledger.transition("S2", StoryStatus::Done, |_| {}).unwrap();
        assert_eq!(ledger.epic("E1").unwrap().status, StoryStatus::Done);
    }

    #[test]
    fn load_runs_on_a_plain_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let ledger = tokio_test::block_on(TaskLedger::open(&config, Utc::now())).unwrap();
        assert_eq!(ledger.counts().total, 0);
    }
}
