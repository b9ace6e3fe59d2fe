//! Legal story status transitions.
//!
//! ```text
//! backlog      -> in_progress (assign), done (skip)
//! in_progress  -> testing (mark ready), failed (setup error), done (skip)
//! testing      -> done (pass / skip), failed (fail / setup error)
//! failed       -> backlog (automatic retry), in_progress (re-claim), done (skip)
//! done         -> (terminal)
//! ```
//!
//! Nothing moves from testing or done back to backlog; the only way back into
//! the backlog is the retry path through failed.

use super::story::StoryStatus;

/// Whether `from -> to` is a legal status change. Same-status is not a
/// transition and is always allowed.
pub fn is_legal(from: StoryStatus, to: StoryStatus) -> bool {
    use StoryStatus::*;

    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (Backlog, InProgress)
            | (Backlog, Done)
            | (InProgress, Testing)
            | (InProgress, Failed)
            | (InProgress, Done)
            | (Testing, Done)
            | (Testing, Failed)
            | (Failed, Backlog)
            | (Failed, InProgress)
            | (Failed, Done)
    )
}
