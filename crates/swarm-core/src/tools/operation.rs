//! Named operations workers can invoke, with typed inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SwarmError};
use crate::kernel::TestReport;

/// A worker's raw request: an operation name and its JSON input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRef {
    pub story_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultsInput {
    pub story_id: String,
    #[serde(flatten)]
    pub report: TestReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupErrorInput {
    pub story_id: String,
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipTestingInput {
    pub story_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteFileInput {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFileInput {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadFileInput {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStoryInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub epic_id: Option<String>,
    #[serde(default)]
    pub foundation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEpicInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub story_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ListStoriesInput {
    #[serde(default)]
    pub status: Option<String>,
}

/// Every operation the registry knows, with its parsed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    StartStory(StoryRef),
    MarkReadyForTesting(StoryRef),
    ReportTestResults(TestResultsInput),
    ReportSetupError(SetupErrorInput),
    SkipTesting(SkipTestingInput),
    WriteFile(WriteFileInput),
    EditFile(EditFileInput),
    ReadFile(ReadFileInput),
    CreateStory(CreateStoryInput),
    CreateEpic(CreateEpicInput),
    GetStory(StoryRef),
    ListStories(ListStoriesInput),
    /// Name not in the catalog
    Unknown(String),
}

pub const OPERATION_NAMES: &[&str] = &[
    "start_story",
    "mark_ready_for_testing",
    "report_test_results",
    "report_setup_error",
    "skip_testing",
    "write_file",
    "edit_file",
    "read_file",
    "create_story",
    "create_epic",
    "get_story",
    "list_stories",
];

impl Operation {
    /// Parse a request. Unknown names become [`Operation::Unknown`]; a known
    /// name with a malformed input is [`SwarmError::InvalidInput`].
    pub fn parse(request: &ToolRequest) -> Result<Self> {
        let input = match &request.input {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let op = match request.name.as_str() {
            "start_story" => Self::StartStory(payload(&request.name, input)?),
            "mark_ready_for_testing" => Self::MarkReadyForTesting(payload(&request.name, input)?),
            "report_test_results" => Self::ReportTestResults(payload(&request.name, input)?),
            "report_setup_error" => Self::ReportSetupError(payload(&request.name, input)?),
            "skip_testing" => Self::SkipTesting(payload(&request.name, input)?),
            "write_file" => Self::WriteFile(payload(&request.name, input)?),
            "edit_file" => Self::EditFile(payload(&request.name, input)?),
            "read_file" => Self::ReadFile(payload(&request.name, input)?),
            "create_story" => Self::CreateStory(payload(&request.name, input)?),
            "create_epic" => Self::CreateEpic(payload(&request.name, input)?),
            "get_story" => Self::GetStory(payload(&request.name, input)?),
            "list_stories" => Self::ListStories(payload(&request.name, input)?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(op)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::StartStory(_) => "start_story",
            Self::MarkReadyForTesting(_) => "mark_ready_for_testing",
            Self::ReportTestResults(_) => "report_test_results",
            Self::ReportSetupError(_) => "report_setup_error",
            Self::SkipTesting(_) => "skip_testing",
            Self::WriteFile(_) => "write_file",
            Self::EditFile(_) => "edit_file",
            Self::ReadFile(_) => "read_file",
            Self::CreateStory(_) => "create_story",
            Self::CreateEpic(_) => "create_epic",
            Self::GetStory(_) => "get_story",
            Self::ListStories(_) => "list_stories",
            Self::Unknown(name) => name,
        }
    }

    /// Whether a successful run changes the ledger and must be persisted.
    pub fn mutates_ledger(&self) -> bool {
        matches!(
            self,
            Self::StartStory(_)
                | Self::MarkReadyForTesting(_)
                | Self::ReportTestResults(_)
                | Self::ReportSetupError(_)
                | Self::SkipTesting(_)
                | Self::CreateStory(_)
                | Self::CreateEpic(_)
        )
    }
}

fn payload<T: serde::de::DeserializeOwned>(name: &str, input: Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| SwarmError::InvalidInput(format!("{name}: {e}")))
}
