//! Scheduler - assigns eligible stories to worker pools and drives the
//! pass/fail/retry lifecycle.
//!
//! The scheduler never owns story storage; every call takes the ledger through
//! the [`StoryStore`] interface.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::outcome::{CompletionOutcome, FailureClass, TestReport};
use super::pool::{WorkerPool, WorkerRole, WorkerState};
use crate::config::{PoolConfig, SwarmConfig};
use crate::error::{Result, SwarmError};
use crate::state::{generate_story_id, Priority, Story, StoryStatus, StoryStore};

/// Durable scheduling progress, stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    #[serde(default)]
    pub completed_story_ids: BTreeSet<String>,
    #[serde(default)]
    pub foundation_story_id: Option<String>,
    #[serde(default)]
    pub foundation_complete: bool,
}

/// One story handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub story_id: String,
    pub worker_id: String,
    pub role: WorkerRole,
}

/// Result of a scheduling cycle.
#[derive(Debug, Default)]
pub struct ScheduleResult {
    /// Backlog stories whose dependencies are satisfied
    pub ready: Vec<String>,
    /// Assignments made this cycle
    pub assigned: Vec<Assignment>,
    /// Testing stories still waiting for a tester
    pub awaiting_tester: Vec<String>,
}

impl ScheduleResult {
    pub fn summary(&self) -> String {
        format!(
            "Ready: {}, Assigned: {}, Awaiting tester: {}",
            self.ready.len(),
            self.assigned.len(),
            self.awaiting_tester.len()
        )
    }
}

/// Result of a worker claiming a story directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyYours,
    HeldBy(String),
}

/// Scheduler for selecting and prioritizing work.
#[derive(Debug)]
pub struct Scheduler {
    pools: Vec<WorkerPool>,
    max_retries: u32,
    state: SchedulerState,
    aborted: bool,
}

impl Scheduler {
    pub fn new(pools: &PoolConfig, max_retries: u32) -> Self {
        Self {
            pools: vec![
                WorkerPool::new(WorkerRole::Coder, pools.coder),
                WorkerPool::new(WorkerRole::Tester, pools.tester),
                WorkerPool::new(WorkerRole::Fixer, pools.fixer),
            ],
            max_retries,
            state: SchedulerState::default(),
            aborted: false,
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self::new(&config.pools, config.max_retries)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn state(&self) -> SchedulerState {
        self.state.clone()
    }

    pub fn restore_state(&mut self, state: SchedulerState) {
        info!(
            completed = state.completed_story_ids.len(),
            foundation = state.foundation_story_id.as_deref().unwrap_or("-"),
            foundation_complete = state.foundation_complete,
            "Scheduler state restored"
        );
        self.state = state;
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerState> {
        self.pools.iter().flat_map(|p| p.workers().iter())
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerState> {
        self.workers().find(|w| w.id == worker_id)
    }

    pub fn pool(&self, role: WorkerRole) -> Option<&WorkerPool> {
        self.pools.iter().find(|p| p.role() == role)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Stop assigning and idle every worker. Stories are left untouched so a
    /// resume can re-evaluate them.
    pub fn abort(&mut self) {
        self.aborted = true;
        for pool in &mut self.pools {
            pool.idle_all();
        }
        info!("Scheduler aborted, all workers idle");
    }

    /// Whether `story` may be picked up now.
    pub fn is_eligible<S: StoryStore>(&self, store: &S, story: &Story) -> bool {
        if !story.is_eligible(|dep| store.is_done(dep)) {
            return false;
        }
        match (&self.state.foundation_story_id, self.state.foundation_complete) {
            (Some(foundation), false) => &story.id == foundation,
            _ => true,
        }
    }

    /// Eligible backlog stories, highest priority first, then by id.
    pub fn ready_stories<'a, S: StoryStore>(&self, store: &'a S) -> Vec<&'a Story> {
        let mut ready: Vec<&Story> = store
            .stories()
            .iter()
            .filter(|s| self.is_eligible(store, s))
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.id.cmp(&b.id))
        });
        ready
    }

    /// Run a scheduling cycle
    pub fn schedule<S: StoryStore>(&mut self, store: &mut S) -> ScheduleResult {
        let mut result = ScheduleResult::default();
        self.refresh_progress(store);
        self.reconcile(store);
        if self.aborted {
            return result;
        }

        // Hand testing stories to testers first so finished work drains.
        let mut awaiting: Vec<(u8, String)> = store
            .stories()
            .iter()
            .filter(|s| s.status == StoryStatus::Testing)
            .filter(|s| !self.is_held_by_tester(s))
            .map(|s| (s.priority.rank(), s.id.clone()))
            .collect();
        awaiting.sort();

        for (_, story_id) in awaiting {
            let Some(tester) = self.idle_worker(WorkerRole::Tester) else {
                result.awaiting_tester.push(story_id);
                continue;
            };
            match store.update_story(&story_id, |s| s.assigned_worker_id = Some(tester.clone())) {
                Ok(_) => {
                    self.occupy(&tester, &story_id);
                    info!(story_id = %story_id, worker_id = %tester, "Testing assigned");
                    result.assigned.push(Assignment {
                        story_id,
                        worker_id: tester,
                        role: WorkerRole::Tester,
                    });
                }
                Err(e) => warn!(story_id = %story_id, error = %e, "Could not hand story to tester"),
            }
        }

        let ready: Vec<(String, bool)> = self
            .ready_stories(store)
            .into_iter()
            .map(|s| (s.id.clone(), s.is_remediation()))
            .collect();
        result.ready = ready.iter().map(|(id, _)| id.clone()).collect();

        for (story_id, remediation) in ready {
            let role = self.role_for(remediation);
            let Some(worker_id) = self.idle_worker(role) else {
                continue;
            };
            match store.transition(&story_id, StoryStatus::InProgress, |s| {
                s.assigned_worker_id = Some(worker_id.clone());
            }) {
                Ok(_) => {
                    self.occupy(&worker_id, &story_id);
                    result.assigned.push(Assignment {
                        story_id,
                        worker_id,
                        role,
                    });
                }
                Err(e) => warn!(story_id = %story_id, error = %e, "Assignment rejected"),
            }
        }

        if !result.assigned.is_empty() {
            debug!(summary = %result.summary(), "Scheduling cycle");
        }
        result
    }

    /// A worker claims a story directly (backlog or failed).
    pub fn claim<S: StoryStore>(
        &mut self,
        store: &mut S,
        story_id: &str,
        worker_id: &str,
    ) -> Result<ClaimOutcome> {
        let story = store
            .story(story_id)
            .ok_or_else(|| SwarmError::StoryNotFound(story_id.to_string()))?;

        if let Some(holder) = &story.assigned_worker_id {
            return Ok(if holder == worker_id {
                ClaimOutcome::AlreadyYours
            } else {
                ClaimOutcome::HeldBy(holder.clone())
            });
        }
        if let Some(current) = self.worker(worker_id).and_then(|w| w.current_story()) {
            return Err(SwarmError::InvalidInput(format!(
                "Worker {worker_id} is already working on {current}"
            )));
        }
        if !matches!(story.status, StoryStatus::Backlog | StoryStatus::Failed) {
            return Err(SwarmError::TransitionRejected {
                story_id: story_id.to_string(),
                from: story.status,
                to: StoryStatus::InProgress,
            });
        }
        let blocked: Vec<String> = story
            .depends_on
            .iter()
            .filter(|dep| !store.is_done(dep))
            .cloned()
            .collect();
        if !blocked.is_empty() {
            return Err(SwarmError::InvalidInput(format!(
                "Story {} is blocked by unfinished dependencies: {}",
                story_id,
                blocked.join(", ")
            )));
        }

        store.transition(story_id, StoryStatus::InProgress, |s| {
            s.assigned_worker_id = Some(worker_id.to_string());
        })?;
        self.occupy(worker_id, story_id);
        Ok(ClaimOutcome::Claimed)
    }

    /// Coder hands a story to testing; the coder is freed.
    pub fn mark_ready<S: StoryStore>(
        &mut self,
        store: &mut S,
        story_id: &str,
        worker_id: &str,
    ) -> Result<()> {
        let story = store
            .story(story_id)
            .ok_or_else(|| SwarmError::StoryNotFound(story_id.to_string()))?;
        if let Some(holder) = &story.assigned_worker_id {
            if holder != worker_id {
                return Err(SwarmError::InvalidInput(format!(
                    "Story {story_id} is assigned to {holder}, not {worker_id}"
                )));
            }
        }
        store.transition(story_id, StoryStatus::Testing, |_| {})?;
        self.release_story(story_id);
        Ok(())
    }

    /// Apply a test report: pass, retry, park, or route to setup failure.
    pub fn complete<S: StoryStore>(
        &mut self,
        store: &mut S,
        story_id: &str,
        report: &TestReport,
    ) -> Result<CompletionOutcome> {
        report.validate()?;
        let story = store
            .story(story_id)
            .ok_or_else(|| SwarmError::StoryNotFound(story_id.to_string()))?;
        if story.status != StoryStatus::Testing {
            let to = if report.succeeded() {
                StoryStatus::Done
            } else {
                StoryStatus::Failed
            };
            return Err(SwarmError::TransitionRejected {
                story_id: story_id.to_string(),
                from: story.status,
                to,
            });
        }
        if report.succeeded() {
            store.transition(story_id, StoryStatus::Done, |_| {})?;
            self.release_story(story_id);
            self.on_done(store, story_id);
            return Ok(CompletionOutcome::Passed);
        }

        let output = report.error_output.clone().unwrap_or_default();
        if FailureClass::classify(&output) == FailureClass::Infrastructure {
            self.setup_failure(store, story_id, "environment", &output)?;
            return Ok(CompletionOutcome::SetupFailed);
        }

        let failure = SwarmError::TestFailure {
            story_id: story_id.to_string(),
            failed: report.failed_count,
            total: report.total,
        };
        let diagnostic = match report.error_output.as_deref() {
            Some(out) if !out.trim().is_empty() => format!("{failure}\n{}", out.trim()),
            _ => failure.to_string(),
        };
        let failed = store.transition(story_id, StoryStatus::Failed, |s| {
            s.retry_count += 1;
            s.diagnostics.push(diagnostic);
        })?;
        let retry_count = failed.retry_count;
        self.release_story(story_id);

        if retry_count < self.max_retries {
            store.transition(story_id, StoryStatus::Backlog, |_| {})?;
            info!(story_id = %story_id, retry_count, "Story failed, requeued");
            return Ok(CompletionOutcome::Requeued { retry_count });
        }

        let remediation_id = self.spawn_remediation(store, story_id)?;
        warn!(story_id = %story_id, retry_count, remediation_id = %remediation_id, "Story parked");
        Ok(CompletionOutcome::Parked {
            retry_count,
            remediation_id,
        })
    }

    /// Infrastructure failure: straight to failed, retry count untouched.
    pub fn setup_failure<S: StoryStore>(
        &mut self,
        store: &mut S,
        story_id: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let story = store
            .story(story_id)
            .ok_or_else(|| SwarmError::StoryNotFound(story_id.to_string()))?;
        if !story.status.is_claimed() {
            return Err(SwarmError::TransitionRejected {
                story_id: story_id.to_string(),
                from: story.status,
                to: StoryStatus::Failed,
            });
        }
        let note = SwarmError::SetupError {
            story_id: story_id.to_string(),
            kind: kind.to_string(),
            message: message.trim().to_string(),
        }
        .to_string();
        store.transition(story_id, StoryStatus::Failed, |s| s.diagnostics.push(note))?;
        self.release_story(story_id);
        warn!(story_id = %story_id, kind, "Story failed on setup error");
        Ok(())
    }

    /// Explicit override to done with an audited reason.
    pub fn skip<S: StoryStore>(&mut self, store: &mut S, story_id: &str, reason: &str) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(SwarmError::InvalidInput("A skip reason is required".into()));
        }
        store.transition(story_id, StoryStatus::Done, |s| {
            s.skip_reason = Some(reason.trim().to_string());
        })?;
        self.release_story(story_id);
        info!(story_id = %story_id, reason = %reason.trim(), "Testing skipped");
        self.on_done(store, story_id);
        Ok(())
    }

    /// Mark pool workers busy for stories the ledger already shows them
    /// holding. Returns how many claims were adopted.
    pub fn adopt_claims<S: StoryStore>(&mut self, store: &S) -> usize {
        let mut adopted = 0;
        for story in store.stories().iter().filter(|s| s.status.is_claimed()) {
            let Some(worker_id) = story.assigned_worker_id.as_deref() else {
                continue;
            };
            if self
                .worker(worker_id)
                .is_some_and(|w| w.is_idle() && holds(w, story))
            {
                self.occupy(worker_id, &story.id);
                adopted += 1;
            }
        }
        if adopted > 0 {
            debug!(adopted, "Adopted existing story claims");
        }
        adopted
    }

    /// Free whichever worker is busy with `story_id`.
    pub fn release_story(&mut self, story_id: &str) {
        for pool in &mut self.pools {
            let busy = pool.busy_with(story_id).map(|w| w.id.clone());
            if let Some(id) = busy {
                pool.release(&id);
            }
        }
    }

    /// Idle every busy worker whose story the store no longer shows it
    /// holding, e.g. after another process moved the story on. Returns the
    /// freed worker ids.
    pub fn reconcile<S: StoryStore>(&mut self, store: &S) -> Vec<String> {
        let orphaned: Vec<(String, String)> = self
            .workers()
            .filter_map(|w| {
                let story_id = w.current_story()?;
                let held = store.story(story_id).is_some_and(|s| holds(w, s));
                (!held).then(|| (w.id.clone(), story_id.to_string()))
            })
            .collect();
        for (worker_id, story_id) in &orphaned {
            info!(worker_id = %worker_id, story_id = %story_id, "Worker freed, story no longer held");
            self.release(worker_id);
        }
        orphaned.into_iter().map(|(worker_id, _)| worker_id).collect()
    }

    fn on_done<S: StoryStore>(&mut self, store: &mut S, story_id: &str) {
        self.state.completed_story_ids.insert(story_id.to_string());
        if self.state.foundation_story_id.as_deref() == Some(story_id) {
            self.state.foundation_complete = true;
            info!(story_id = %story_id, "Foundation complete");
        }

        // A finished remediation sends the parked story back for another round.
        let parked = store
            .story(story_id)
            .and_then(|s| s.remediation_of.clone())
            .filter(|orig| store.story(orig).is_some_and(|s| s.status == StoryStatus::Failed));
        if let Some(original) = parked {
            match store.transition(&original, StoryStatus::Backlog, |s| s.retry_count = 0) {
                Ok(_) => info!(story_id = %original, remediation_id = %story_id, "Parked story requeued after remediation"),
                Err(e) => warn!(story_id = %original, error = %e, "Could not requeue parked story"),
            }
        }
    }

    fn spawn_remediation<S: StoryStore>(&mut self, store: &mut S, story_id: &str) -> Result<String> {
        let existing = store
            .stories()
            .iter()
            .find(|s| s.remediation_of.as_deref() == Some(story_id) && !s.status.is_terminal())
            .map(|s| s.id.clone());
        if let Some(id) = existing {
            return Ok(id);
        }

        let parked = store
            .story(story_id)
            .ok_or_else(|| SwarmError::StoryNotFound(story_id.to_string()))?;
        let mut description = format!(
            "Story {} ({}) failed {} times and is parked.\n\n{}",
            parked.id, parked.title, parked.retry_count, parked.description
        );
        if !parked.diagnostics.is_empty() {
            description.push_str("\n\nDiagnostics:\n");
            for (n, entry) in parked.diagnostics.iter().enumerate() {
                description.push_str(&format!("--- attempt {} ---\n{}\n", n + 1, entry));
            }
        }

        let mut remediation = Story::with_id(generate_story_id(Utc::now()), format!("Fix: {}", parked.title))
            .description(description)
            .priority(Priority::High);
        remediation.created_at = Some(Utc::now());
        remediation.epic_id = parked.epic_id.clone();
        remediation.remediation_of = Some(parked.id.clone());
        remediation.depends_on = parked.depends_on.clone();
        remediation.acceptance_criteria = vec![format!("Tests for {} pass", parked.id)];
        remediation
            .acceptance_criteria
            .extend(parked.acceptance_criteria.iter().cloned());

        let id = remediation.id.clone();
        store.insert_story(remediation)?;
        Ok(id)
    }

    fn refresh_progress<S: StoryStore>(&mut self, store: &S) {
        if self.state.foundation_story_id.is_none() {
            self.state.foundation_story_id = store
                .stories()
                .iter()
                .find(|s| s.foundation)
                .map(|s| s.id.clone());
        }
        if let Some(foundation) = &self.state.foundation_story_id {
            if !self.state.foundation_complete && store.is_done(foundation) {
                self.state.foundation_complete = true;
            }
        }
        for story in store.stories() {
            if story.status.is_terminal() {
                self.state.completed_story_ids.insert(story.id.clone());
            }
        }
    }

    fn is_held_by_tester(&self, story: &Story) -> bool {
        story
            .assigned_worker_id
            .as_deref()
            .and_then(|id| self.worker(id))
            .is_some_and(|w| w.role == WorkerRole::Tester)
    }

    fn role_for(&self, remediation: bool) -> WorkerRole {
        let has_fixers = self.pool(WorkerRole::Fixer).is_some_and(|p| p.size() > 0);
        if remediation && has_fixers {
            WorkerRole::Fixer
        } else {
            WorkerRole::Coder
        }
    }

    fn idle_worker(&self, role: WorkerRole) -> Option<String> {
        self.pool(role)
            .and_then(|p| p.next_idle())
            .map(|w| w.id.clone())
    }

    fn occupy(&mut self, worker_id: &str, story_id: &str) {
        for pool in &mut self.pools {
            if pool.occupy(worker_id, story_id) {
                return;
            }
        }
    }

    fn release(&mut self, worker_id: &str) {
        for pool in &mut self.pools {
            if pool.release(worker_id) {
                return;
            }
        }
    }
}

/// Whether `story` is actively held by `worker`. A testing story still
/// carrying its coder's id is waiting for a tester, not held.
fn holds(worker: &WorkerState, story: &Story) -> bool {
    if story.assigned_worker_id.as_deref() != Some(worker.id.as_str()) {
        return false;
    }
    match story.status {
        StoryStatus::InProgress => true,
        StoryStatus::Testing => worker.role == WorkerRole::Tester,
        _ => false,
    }
}
