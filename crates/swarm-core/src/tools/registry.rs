//! Tool registry - routes worker operations to handlers and renders every
//! outcome, including errors and panics, as text.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::handlers;
use super::operation::{Operation, ToolRequest, OPERATION_NAMES};
use crate::error::SwarmError;
use crate::kernel::Scheduler;
use crate::locks::FileLockManager;
use crate::observability::{EventSink, SessionEvent};
use crate::state::TaskLedger;

/// Everything a handler may touch during one invocation.
pub struct ToolContext<'a> {
    pub ledger: &'a mut TaskLedger,
    pub scheduler: &'a mut Scheduler,
    pub locks: &'a FileLockManager,
    pub events: &'a EventSink,
    /// The calling worker
    pub worker_id: &'a str,
}

/// Text result handed back to the calling worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn names(&self) -> &'static [&'static str] {
        OPERATION_NAMES
    }

    /// Run one request. Never fails and never unwinds.
    pub async fn dispatch(&self, ctx: &mut ToolContext<'_>, request: &ToolRequest) -> ToolOutput {
        let op = match Operation::parse(request) {
            Ok(op) => op,
            Err(e) => return ToolOutput::error(format!("Error: {e}")),
        };
        debug!(operation = op.name(), worker_id = ctx.worker_id, "Dispatching operation");

        let name = op.name().to_string();
        let mutates = op.mutates_ledger();
        let outcome = AssertUnwindSafe(handlers::handle(ctx, op)).catch_unwind().await;

        let mut output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                report_error(ctx, &e);
                ToolOutput::error(render_error(&e))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(operation = %name, worker_id = ctx.worker_id, panic = %message, "Handler panicked");
                return ToolOutput::error(format!("Error: {name} failed internally: {message}"));
            }
        };

        if mutates && !output.is_error {
            if let Err(e) = ctx.ledger.persist().await {
                warn!(operation = %name, error = %e, "Ledger not persisted after operation");
                output.text.push_str(&format!("\nWarning: ledger not persisted: {e}"));
            }
        }
        output
    }
}

fn render_error(e: &SwarmError) -> String {
    match e {
        SwarmError::UnknownOperation(name) => format!(
            "Error: Unknown operation: {name}. Available operations: {}",
            OPERATION_NAMES.join(", ")
        ),
        other => format!("Error: {other}"),
    }
}

fn report_error(ctx: &ToolContext<'_>, e: &SwarmError) {
    if e.is_recoverable() {
        debug!(worker_id = ctx.worker_id, error = %e, "Operation rejected");
    } else {
        error!(worker_id = ctx.worker_id, error = %e, "Operation failed on an orchestrator fault");
    }
    match e {
        SwarmError::LockConflict { path, holder, .. } => {
            ctx.events.emit(SessionEvent::LockConflict {
                path: path.display().to_string(),
                holder: holder.clone(),
                requester: ctx.worker_id.to_string(),
            });
        }
        SwarmError::TransitionRejected { story_id, from, to } => {
            ctx.events.emit(SessionEvent::TransitionRejected {
                story_id: story_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        SwarmError::StaleDataRejected { id, .. } => {
            ctx.events.emit(SessionEvent::StaleDataRejected { id: id.clone() });
        }
        _ => {}
    }
}
