//! Kernel - worker pools, scheduling, and test outcome handling.

mod outcome;
mod pool;
mod scheduler;

pub use outcome::{CompletionOutcome, FailureClass, TestReport};
pub use pool::{WorkerPool, WorkerRole, WorkerState, WorkerStatus};
pub use scheduler::{Assignment, ClaimOutcome, ScheduleResult, Scheduler, SchedulerState};
