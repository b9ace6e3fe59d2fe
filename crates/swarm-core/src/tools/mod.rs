//! Worker-facing operations: parsing, dispatch, and handlers.

mod handlers;
mod operation;
mod registry;

pub use operation::{
    CreateEpicInput, CreateStoryInput, EditFileInput, ListStoriesInput, Operation, ReadFileInput,
    SetupErrorInput, SkipTestingInput, StoryRef, TestResultsInput, ToolRequest, WriteFileInput,
    OPERATION_NAMES,
};
pub use registry::{ToolContext, ToolOutput, ToolRegistry};
