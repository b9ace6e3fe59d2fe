//! Story and epic models - the units of work in the ledger.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A single assignable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    /// Unique identifier, embeds its creation timestamp
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub status: StoryStatus,

    /// Worker holding the story (only while in_progress or testing)
    #[serde(default)]
    pub assigned_worker_id: Option<String>,

    /// Stories that must be done first
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,

    /// Foundation stories gate every other story until done
    #[serde(default, skip_serializing_if = "is_false")]
    pub foundation: bool,

    /// The parked story this one remediates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_of: Option<String>,

    /// Accumulated failure output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    #[serde(alias = "pending")]
    Backlog,
    #[serde(alias = "inprogress")]
    InProgress,
    Testing,
    #[serde(alias = "completed")]
    Done,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Testing => "testing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backlog" | "pending" => Some(Self::Backlog),
            "in_progress" | "inprogress" => Some(Self::InProgress),
            "testing" => Some(Self::Testing),
            "done" | "completed" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Done is the only terminal status; failed stories can still be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Statuses that require an assigned worker.
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::InProgress | Self::Testing)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Scheduling rank, lower runs first
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Story {
    /// Create a backlog story with a freshly generated id.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self::with_id(generate_story_id(now), title).created(now)
    }

    /// Create a backlog story with an explicit id.
    pub fn with_id(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: StoryStatus::Backlog,
            assigned_worker_id: None,
            depends_on: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            priority: Priority::Medium,
            retry_count: 0,
            epic_id: None,
            foundation: false,
            remediation_of: None,
            diagnostics: Vec::new(),
            skip_reason: None,
            created_at: None,
            completed_at: None,
        }
    }

    fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn foundation(mut self) -> Self {
        self.foundation = true;
        self
    }

    /// Check if this story can be picked up (backlog with all deps done)
    pub fn is_eligible(&self, is_done: impl Fn(&str) -> bool) -> bool {
        self.status == StoryStatus::Backlog && self.depends_on.iter().all(|dep| is_done(dep))
    }

    /// Timestamp embedded in the id, if any.
    pub fn id_timestamp(&self) -> Option<DateTime<Utc>> {
        id_timestamp(&self.id)
    }

    pub fn is_remediation(&self) -> bool {
        self.remediation_of.is_some()
    }
}

/// Generate a story id of the form `story-<unix-millis>-<8 hex>`.
pub fn generate_story_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("story-{}-{}", now.timestamp_millis(), &suffix[..8])
}

/// Extract the creation timestamp embedded in an id.
///
/// The first `-`/`_` separated segment made only of digits with 13 digits is
/// read as unix millis, with 10 digits as unix seconds.
pub fn id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    id.split(['-', '_'])
        .filter(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()))
        .find_map(|seg| match seg.len() {
            13 => seg
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            10 => seg
                .parse::<i64>()
                .ok()
                .and_then(|s| Utc.timestamp_opt(s, 0).single()),
            _ => None,
        })
}

/// A named grouping of stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub status: StoryStatus,

    #[serde(default)]
    pub story_ids: Vec<String>,
}

impl Epic {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            priority: Priority::Medium,
            status: StoryStatus::Backlog,
            story_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_embed_creation_time() {
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        let id = generate_story_id(now);
        assert!(id.starts_with("story-1760000000123-"));
        assert_eq!(id_timestamp(&id), Some(now));
    }

    #[test]
    fn seconds_timestamps_are_recognised() {
        let ts = id_timestamp("task_1760000000_auth").unwrap();
        assert_eq!(ts.timestamp(), 1_760_000_000);
    }

    #[test]
    fn plain_ids_have_no_timestamp() {
        assert_eq!(id_timestamp("S1"), None);
        assert_eq!(id_timestamp("story-42-login"), None);
    }

    #[test]
    fn status_aliases_deserialize() {
        let pending: StoryStatus = serde_json::from_str("\"pending\"").unwrap();
        let completed: StoryStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(pending, StoryStatus::Backlog);
        assert_eq!(completed, StoryStatus::Done);
        assert_eq!(serde_json::to_string(&StoryStatus::InProgress).unwrap(), "\"in_progress\"");
    }

    #[test]
    fn story_wire_format_is_camel_case() {
        let story = Story::with_id("S1", "Login").depends_on(["S0"]);
        let json = serde_json::to_value(&story).unwrap();
        assert_eq!(json["assignedWorkerId"], serde_json::Value::Null);
        assert_eq!(json["dependsOn"][0], "S0");
        assert_eq!(json["retryCount"], 0);
        assert!(json.get("foundation").is_none());
    }

    #[test]
    fn eligibility_requires_done_dependencies() {
        let story = Story::with_id("S2", "Profile").depends_on(["S1"]);
        assert!(!story.is_eligible(|_| false));
        assert!(story.is_eligible(|id| id == "S1"));

        let mut started = story.clone();
        started.status = StoryStatus::InProgress;
        assert!(!started.is_eligible(|_| true));
    }

    #[test]
    fn priority_rank_orders_critical_first() {
        let mut ps = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        ps.sort_by_key(|p| p.rank());
        assert_eq!(ps, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }
}
