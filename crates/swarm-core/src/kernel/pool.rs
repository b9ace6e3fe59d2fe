//! Worker pools - bounded sets of workers per role.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Roles a worker can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Coder,
    Tester,
    /// Picks up remediation stories for parked work
    Fixer,
}

impl WorkerRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Tester => "tester",
            Self::Fixer => "fixer",
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy { story_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerState {
    pub id: String,
    pub role: WorkerRole,
    pub status: WorkerStatus,
    /// Stories this worker has handed off or finished
    pub completed: usize,
}

impl WorkerState {
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn current_story(&self) -> Option<&str> {
        match &self.status {
            WorkerStatus::Busy { story_id } => Some(story_id),
            WorkerStatus::Idle => None,
        }
    }
}

/// Fixed-size pool of workers sharing one role.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    role: WorkerRole,
    workers: Vec<WorkerState>,
}

impl WorkerPool {
    /// Pool of `size` workers named `<role>-1..=size`.
    pub fn new(role: WorkerRole, size: usize) -> Self {
        let workers = (1..=size)
            .map(|n| WorkerState {
                id: format!("{}-{}", role.name(), n),
                role,
                status: WorkerStatus::Idle,
                completed: 0,
            })
            .collect();
        Self { role, workers }
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[WorkerState] {
        &self.workers
    }

    pub fn next_idle(&self) -> Option<&WorkerState> {
        self.workers.iter().find(|w| w.is_idle())
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerState> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    pub fn busy_with(&self, story_id: &str) -> Option<&WorkerState> {
        self.workers
            .iter()
            .find(|w| w.current_story() == Some(story_id))
    }

    /// Mark a worker busy. Returns false if the worker is not in this pool.
    pub fn occupy(&mut self, worker_id: &str, story_id: &str) -> bool {
        match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) => {
                worker.status = WorkerStatus::Busy {
                    story_id: story_id.to_string(),
                };
                true
            }
            None => false,
        }
    }

    /// Return a worker to idle. Returns false if it was not busy here.
    pub fn release(&mut self, worker_id: &str) -> bool {
        match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) if !worker.is_idle() => {
                worker.status = WorkerStatus::Idle;
                worker.completed += 1;
                true
            }
            _ => false,
        }
    }

    pub fn idle_all(&mut self) {
        for worker in &mut self.workers {
            worker.status = WorkerStatus::Idle;
        }
    }
}
