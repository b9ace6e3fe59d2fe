//! Swarm Core - multi-worker story orchestration kernel
//!
//! This crate coordinates pools of long-running workers around a shared
//! backlog of stories: it validates story state transitions, enforces
//! per-file write locks in the project tree, and survives restarts through
//! versioned checkpoints.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod kernel;
pub mod locks;
pub mod observability;
pub mod session;
pub mod state;
pub mod tools;

pub use checkpoint::{Checkpoint, CheckpointStore, Phase};
pub use config::SwarmConfig;
pub use error::{Result, SwarmError};
pub use kernel::{Scheduler, TestReport, WorkerRole};
pub use locks::FileLockManager;
pub use observability::{EventSink, SessionEvent};
pub use session::{Session, SessionManager, WorkerCapability, WorkerContext};
pub use state::{Epic, Priority, Story, StoryStatus, StoryStore, TaskLedger};
pub use tools::{Operation, ToolOutput, ToolRegistry, ToolRequest};
