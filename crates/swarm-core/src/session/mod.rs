//! Sessions - one orchestration run over one project directory.
//!
//! A session owns the ledger, scheduler, and lock table for its project. The
//! ledger and scheduler sit behind a single async mutex so every story
//! transition is serialized; racing completions converge on one outcome.

mod manager;
mod worker;

pub use manager::SessionManager;
pub use worker::{WorkerCapability, WorkerContext};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::checkpoint::{derive_phase, reset_in_flight, Checkpoint, CheckpointStore, Phase};
use crate::config::SwarmConfig;
use crate::error::Result;
use crate::kernel::{Assignment, Scheduler, WorkerState};
use crate::locks::{FileLockManager, LockInfo};
use crate::observability::{EventRecord, EventSink, SessionEvent};
use crate::state::{ArchiveReport, LedgerCounts, Story, StoryStore, TaskLedger};
use crate::tools::{ToolContext, ToolOutput, ToolRegistry, ToolRequest};

struct SessionState {
    ledger: TaskLedger,
    scheduler: Scheduler,
    stopped: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub phase: Phase,
    pub counts: LedgerCounts,
    pub ready: Vec<String>,
    pub workers: Vec<WorkerState>,
    pub locks: Vec<LockInfo>,
    pub stopped: bool,
}

/// Result of one scheduling tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub assigned: Vec<Assignment>,
    pub ingested: usize,
    pub stale: usize,
}

/// Why [`Session::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Aborted,
    /// Every story reached done
    Finished,
    Stopped,
}

pub struct Session {
    id: String,
    project_id: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    config: SwarmConfig,
    state: Mutex<SessionState>,
    locks: FileLockManager,
    events: EventSink,
    checkpoints: CheckpointStore,
    registry: ToolRegistry,
    ticks: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a fresh session, loading whatever ledger is on disk.
    pub async fn create(working_dir: &Path, config: SwarmConfig) -> Result<Self> {
        let created_at = Utc::now();
        let ledger = TaskLedger::open(&config, created_at).await?;
        let mut scheduler = Scheduler::from_config(&config);
        scheduler.adopt_claims(&ledger);
        let id = uuid::Uuid::new_v4().to_string();
        let stories = ledger.stories().len();
        let session = Self::assemble(id, working_dir, config, created_at, ledger, scheduler);
        info!(
            session_id = %session.id,
            project = %session.working_dir.display(),
            stories,
            "Session created"
        );
        Ok(session)
    }

    /// Resume from the latest checkpoint, or create a fresh session if there
    /// is none.
    ///
    /// The ledger on disk wins for story content. If it is missing or empty
    /// while the checkpoint still has stories, the ledger is rebuilt from the
    /// checkpoint. Either way in-flight stories go back to the backlog.
    pub async fn resume(working_dir: &Path, config: SwarmConfig) -> Result<Self> {
        let store = CheckpointStore::new(&config.checkpoints_dir);
        let Some(checkpoint) = store.load().await? else {
            return Self::create(working_dir, config).await;
        };

        let created_at = Utc::now();
        let mut ledger = TaskLedger::open(&config, created_at).await?;
        let rebuild = ledger.stories().is_empty() && !checkpoint.ledger.stories.is_empty();
        if rebuild {
            warn!(
                version = checkpoint.version,
                stories = checkpoint.ledger.stories.len(),
                ledger_present = ledger.file_exists(),
                "Ledger missing or empty, rebuilding from checkpoint"
            );
            ledger.replace_contents(checkpoint.restored_stories(), checkpoint.ledger.epics.clone());
        } else {
            let stories = ledger.stories().iter().cloned().map(reset_in_flight).collect();
            let epics = ledger.epics().to_vec();
            ledger.replace_contents(stories, epics);
        }
        if let Err(e) = ledger.persist().await {
            warn!(error = %e, "Could not persist resumed ledger");
        }

        let mut scheduler = Scheduler::from_config(&config);
        scheduler.restore_state(checkpoint.scheduler.clone());

        let session = Self::assemble(
            checkpoint.session_id.clone(),
            working_dir,
            config,
            created_at,
            ledger,
            scheduler,
        );
        info!(
            session_id = %session.id,
            version = checkpoint.version,
            phase = checkpoint.phase.as_str(),
            rebuilt = rebuild,
            "Session resumed from checkpoint"
        );
        Ok(session)
    }

    fn assemble(
        id: String,
        working_dir: &Path,
        config: SwarmConfig,
        created_at: DateTime<Utc>,
        ledger: TaskLedger,
        scheduler: Scheduler,
    ) -> Self {
        let project_id = working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| working_dir.display().to_string());
        Self {
            events: EventSink::new(id.clone(), Some(config.events_path.clone())),
            locks: FileLockManager::from_config(working_dir, &config),
            checkpoints: CheckpointStore::new(&config.checkpoints_dir),
            registry: ToolRegistry::new(),
            state: Mutex::new(SessionState {
                ledger,
                scheduler,
                stopped: false,
            }),
            ticks: AtomicU64::new(0),
            id,
            project_id,
            working_dir: working_dir.to_path_buf(),
            created_at,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn locks(&self) -> &FileLockManager {
        &self.locks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Run one operation on behalf of `worker_id`.
    pub async fn invoke(&self, worker_id: &str, request: &ToolRequest) -> ToolOutput {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.stopped {
            return ToolOutput::error(format!("Error: Session {} is stopped", self.id));
        }
        let mut ctx = ToolContext {
            ledger: &mut state.ledger,
            scheduler: &mut state.scheduler,
            locks: &self.locks,
            events: &self.events,
            worker_id,
        };
        self.registry.dispatch(&mut ctx, request).await
    }

    /// Reconcile with disk and assign eligible work.
    pub async fn tick(&self) -> Result<TickReport> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = TickReport::default();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.stopped {
                return Ok(report);
            }

            match state.ledger.sync_external().await {
                Ok(sync) => {
                    report.ingested = sync.added.len();
                    report.stale = sync.stale.len();
                    for id in sync.stale {
                        self.events.emit(SessionEvent::StaleDataRejected { id });
                    }
                }
                Err(e) => warn!(error = %e, "External ledger sync failed"),
            }

            let result = state.scheduler.schedule(&mut state.ledger);
            for assignment in &result.assigned {
                self.events.emit(SessionEvent::StoryAssigned {
                    story_id: assignment.story_id.clone(),
                    worker_id: assignment.worker_id.clone(),
                    role: assignment.role.to_string(),
                });
            }
            if !result.assigned.is_empty() {
                if let Err(e) = state.ledger.persist().await {
                    warn!(error = %e, "Ledger not persisted after scheduling");
                }
            }
            report.assigned = result.assigned;
        }

        let every = self.config.checkpoints.interval_ticks;
        if every > 0 && tick % every == 0 {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Periodic checkpoint failed");
            }
        }
        Ok(report)
    }

    /// Contexts for every worker that currently holds a story.
    async fn busy_workers(&self) -> Vec<WorkerContext> {
        let state = self.state.lock().await;
        state
            .scheduler
            .workers()
            .filter_map(|worker| {
                let story = state.ledger.story(worker.current_story()?)?.clone();
                Some(WorkerContext {
                    session_id: self.id.clone(),
                    worker_id: worker.id.clone(),
                    role: worker.role,
                    story,
                    working_dir: self.working_dir.clone(),
                })
            })
            .collect()
    }

    /// The session event loop. Each tick reconciles and schedules, then asks
    /// every busy worker's capability for operations and dispatches them.
    ///
    /// Returns when `abort` turns true, when every story is done, or when the
    /// session is stopped. In-flight stories are left as they are.
    pub async fn run(
        &self,
        capability: Arc<dyn WorkerCapability>,
        mut abort: watch::Receiver<bool>,
    ) -> Result<RunExit> {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(session_id = %self.id, "Session loop started");

        let exit = loop {
            if *abort.borrow() {
                break RunExit::Aborted;
            }
            tokio::select! {
                _ = aborted(&mut abort) => break RunExit::Aborted,
                _ = interval.tick() => {}
            }

            if self.state.lock().await.stopped {
                break RunExit::Stopped;
            }
            let tick = self.tick().await?;
            debug!(assigned = tick.assigned.len(), "Tick");

            let busy = self.busy_workers().await;
            let proposals = tokio::select! {
                _ = aborted(&mut abort) => break RunExit::Aborted,
                proposals = join_all(busy.iter().map(|ctx| capability.propose(ctx))) => proposals,
            };

            for (ctx, proposal) in busy.iter().zip(proposals) {
                let requests = match proposal {
                    Ok(requests) => requests,
                    Err(e) => {
                        warn!(worker_id = %ctx.worker_id, story_id = %ctx.story.id, error = %e, "Worker capability failed");
                        continue;
                    }
                };
                for request in requests {
                    if *abort.borrow() {
                        break;
                    }
                    let output = self.invoke(&ctx.worker_id, &request).await;
                    if output.is_error {
                        debug!(worker_id = %ctx.worker_id, operation = %request.name, result = %output.text, "Operation failed");
                    }
                }
            }

            if self.phase().await == Phase::Finalize {
                break RunExit::Finished;
            }
        };

        if exit == RunExit::Aborted {
            self.state.lock().await.scheduler.abort();
        }
        info!(session_id = %self.id, exit = ?exit, "Session loop ended");
        Ok(exit)
    }

    pub async fn phase(&self) -> Phase {
        derive_phase(self.state.lock().await.ledger.stories())
    }

    /// Write a checkpoint of the current state and prune old ones.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let checkpoint = {
            let state = self.state.lock().await;
            self.checkpoints
                .save(
                    &self.id,
                    &self.project_id,
                    state.ledger.stories(),
                    state.ledger.epics(),
                    state.scheduler.state(),
                )
                .await?
        };
        self.events.emit(SessionEvent::CheckpointSaved {
            version: checkpoint.version,
            phase: checkpoint.phase.as_str().to_string(),
        });
        if let Err(e) = self.checkpoints.prune(self.config.checkpoints.keep).await {
            warn!(error = %e, "Checkpoint prune failed");
        }
        Ok(checkpoint)
    }

    /// Archive terminal stories, keeping the configured number active.
    pub async fn archive(&self, keep_recent: Option<usize>) -> Result<ArchiveReport> {
        let keep = keep_recent.unwrap_or(self.config.archive.keep_recent);
        self.state.lock().await.ledger.archive_terminal(keep).await
    }

    pub async fn story(&self, id: &str) -> Option<Story> {
        self.state.lock().await.ledger.story(id).cloned()
    }

    pub async fn stories(&self) -> Vec<Story> {
        self.state.lock().await.ledger.stories().to_vec()
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        SessionStatus {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            created_at: self.created_at,
            phase: derive_phase(state.ledger.stories()),
            counts: state.ledger.counts(),
            ready: state
                .scheduler
                .ready_stories(&state.ledger)
                .into_iter()
                .map(|s| s.id.clone())
                .collect(),
            workers: state.scheduler.workers().cloned().collect(),
            locks: self.locks.holders(),
            stopped: state.stopped,
        }
    }

    /// Idle every worker, release every lock, persist, and write a final
    /// checkpoint. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let released = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.scheduler.abort();
            let released = self.locks.release_all();
            if let Err(e) = state.ledger.persist().await {
                warn!(error = %e, "Ledger not persisted on stop");
            }
            released
        };
        self.checkpoint().await?;
        self.events.emit(SessionEvent::SessionStopped {
            locks_released: released,
        });
        info!(session_id = %self.id, locks_released = released, "Session stopped");
        Ok(())
    }
}

/// Resolves once the abort flag is true. Never resolves if the sender is gone.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
