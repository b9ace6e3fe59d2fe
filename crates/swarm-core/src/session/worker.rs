//! Worker capability - the pluggable intelligence that decides what a busy
//! worker does next.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::kernel::WorkerRole;
use crate::state::Story;
use crate::tools::ToolRequest;

/// What a worker sees when asked for its next steps.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub session_id: String,
    pub worker_id: String,
    pub role: WorkerRole,
    /// The story the worker is assigned to
    pub story: Story,
    pub working_dir: PathBuf,
}

/// Trait for worker capabilities.
///
/// The session only drives a capability; it never inspects how proposals are
/// produced. Returned requests are dispatched in order through the registry.
#[async_trait]
pub trait WorkerCapability: Send + Sync {
    /// Operations to run for the worker's current story.
    async fn propose(&self, ctx: &WorkerContext) -> Result<Vec<ToolRequest>>;
}
