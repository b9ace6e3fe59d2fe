//! State management - stories, epics, the ledger and its archive.

mod archive;
mod ledger;
mod story;
pub mod transition;

pub use archive::{ArchiveFile, ArchiveStore};
pub use ledger::{ArchiveReport, LedgerCounts, LedgerFile, StoryStore, SyncReport, TaskLedger};
pub use story::{generate_story_id, id_timestamp, Epic, Priority, Story, StoryStatus};
