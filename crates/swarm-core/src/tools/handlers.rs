//! Operation handlers.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use super::operation::*;
use super::registry::{ToolContext, ToolOutput};
use crate::error::{Result, SwarmError};
use crate::kernel::{ClaimOutcome, CompletionOutcome};
use crate::locks::Acquired;
use crate::observability::SessionEvent;
use crate::state::{generate_story_id, Epic, Priority, Story, StoryStatus, StoryStore};

pub(super) async fn handle(ctx: &mut ToolContext<'_>, op: Operation) -> Result<ToolOutput> {
    match op {
        Operation::StartStory(input) => start_story(ctx, input),
        Operation::MarkReadyForTesting(input) => mark_ready(ctx, input),
        Operation::ReportTestResults(input) => report_test_results(ctx, input),
        Operation::ReportSetupError(input) => report_setup_error(ctx, input),
        Operation::SkipTesting(input) => skip_testing(ctx, input),
        Operation::WriteFile(input) => write_file(ctx, input),
        Operation::EditFile(input) => edit_file(ctx, input),
        Operation::ReadFile(input) => ctx.locks.read_file(Path::new(&input.path)).map(ToolOutput::ok),
        Operation::CreateStory(input) => create_story(ctx, input),
        Operation::CreateEpic(input) => create_epic(ctx, input),
        Operation::GetStory(input) => get_story(ctx, input),
        Operation::ListStories(input) => list_stories(ctx, input),
        Operation::Unknown(name) => Err(SwarmError::UnknownOperation(name)),
    }
}

fn start_story(ctx: &mut ToolContext<'_>, input: StoryRef) -> Result<ToolOutput> {
    let id = input.story_id;
    match ctx.scheduler.claim(&mut *ctx.ledger, &id, ctx.worker_id)? {
        ClaimOutcome::Claimed => {
            let role = ctx
                .scheduler
                .worker(ctx.worker_id)
                .map(|w| w.role.to_string())
                .unwrap_or_else(|| "external".to_string());
            ctx.events.emit(SessionEvent::StoryAssigned {
                story_id: id.clone(),
                worker_id: ctx.worker_id.to_string(),
                role,
            });
            Ok(ToolOutput::ok(format!(
                "Story {id} started by {}; status in_progress",
                ctx.worker_id
            )))
        }
        ClaimOutcome::AlreadyYours => Ok(ToolOutput::ok(format!("Story {id} is already assigned to you"))),
        ClaimOutcome::HeldBy(holder) => Ok(ToolOutput::error(format!(
            "Story {id} is being worked on by {holder}"
        ))),
    }
}

fn mark_ready(ctx: &mut ToolContext<'_>, input: StoryRef) -> Result<ToolOutput> {
    let id = input.story_id;
    ctx.scheduler.mark_ready(&mut *ctx.ledger, &id, ctx.worker_id)?;
    ctx.locks.release_all_for(ctx.worker_id);
    ctx.events.emit(SessionEvent::StoryReadyForTesting {
        story_id: id.clone(),
        worker_id: ctx.worker_id.to_string(),
    });
    Ok(ToolOutput::ok(format!("Story {id} is ready for testing")))
}

fn report_test_results(ctx: &mut ToolContext<'_>, input: TestResultsInput) -> Result<ToolOutput> {
    let id = input.story_id;
    let report = input.report;
    let outcome = ctx.scheduler.complete(&mut *ctx.ledger, &id, &report)?;
    ctx.locks.release_all_for(ctx.worker_id);
    let max = ctx.scheduler.max_retries();

    let text = match outcome {
        CompletionOutcome::Passed => {
            ctx.events.emit(SessionEvent::StoryCompleted {
                story_id: id.clone(),
                skip_reason: None,
            });
            format!("Story {id} passed ({}) and is done", report.summary())
        }
        CompletionOutcome::Requeued { retry_count } => {
            ctx.events.emit(SessionEvent::StoryFailed {
                story_id: id.clone(),
                retry_count,
                reason: report.summary(),
            });
            ctx.events.emit(SessionEvent::StoryRequeued {
                story_id: id.clone(),
                retry_count,
            });
            format!(
                "Story {id} failed ({}); retry {retry_count} of {max}, returned to backlog",
                report.summary()
            )
        }
        CompletionOutcome::Parked {
            retry_count,
            remediation_id,
        } => {
            ctx.events.emit(SessionEvent::StoryFailed {
                story_id: id.clone(),
                retry_count,
                reason: report.summary(),
            });
            ctx.events.emit(SessionEvent::RemediationCreated {
                story_id: remediation_id.clone(),
                remediation_of: id.clone(),
            });
            ctx.events.emit(SessionEvent::StoryParked {
                story_id: id.clone(),
                remediation_id: remediation_id.clone(),
            });
            format!(
                "Story {id} failed {retry_count} times ({}) and is parked; remediation story {remediation_id} created",
                report.summary()
            )
        }
        CompletionOutcome::SetupFailed => {
            let retry_count = ctx.ledger.story(&id).map_or(0, |s| s.retry_count);
            ctx.events.emit(SessionEvent::StoryFailed {
                story_id: id.clone(),
                retry_count,
                reason: "setup error".to_string(),
            });
            format!("Story {id} failed on an environment error; no retry consumed")
        }
    };
    Ok(ToolOutput::ok(text))
}

fn report_setup_error(ctx: &mut ToolContext<'_>, input: SetupErrorInput) -> Result<ToolOutput> {
    let id = input.story_id;
    ctx.scheduler
        .setup_failure(&mut *ctx.ledger, &id, &input.error_type, &input.message)?;
    ctx.locks.release_all_for(ctx.worker_id);
    let retry_count = ctx.ledger.story(&id).map_or(0, |s| s.retry_count);
    ctx.events.emit(SessionEvent::StoryFailed {
        story_id: id.clone(),
        retry_count,
        reason: format!("setup error ({})", input.error_type),
    });
    Ok(ToolOutput::ok(format!(
        "Story {id} marked failed: setup error ({}); no retry consumed",
        input.error_type
    )))
}

fn skip_testing(ctx: &mut ToolContext<'_>, input: SkipTestingInput) -> Result<ToolOutput> {
    let id = input.story_id;
    ctx.scheduler.skip(&mut *ctx.ledger, &id, &input.reason)?;
    ctx.locks.release_all_for(ctx.worker_id);
    ctx.events.emit(SessionEvent::StoryCompleted {
        story_id: id.clone(),
        skip_reason: Some(input.reason.trim().to_string()),
    });
    Ok(ToolOutput::ok(format!("Story {id} marked done without testing: {}", input.reason.trim())))
}

fn write_file(ctx: &mut ToolContext<'_>, input: WriteFileInput) -> Result<ToolOutput> {
    let acquired = ctx
        .locks
        .write_file(Path::new(&input.path), ctx.worker_id, input.content.as_bytes())?;
    note_reclaim(ctx, &input.path, &acquired);
    Ok(ToolOutput::ok(format!("Wrote {} bytes to {}", input.content.len(), input.path)))
}

fn edit_file(ctx: &mut ToolContext<'_>, input: EditFileInput) -> Result<ToolOutput> {
    let acquired = ctx.locks.edit_file(
        Path::new(&input.path),
        ctx.worker_id,
        &input.old_string,
        &input.new_string,
    )?;
    note_reclaim(ctx, &input.path, &acquired);
    Ok(ToolOutput::ok(format!("Edited {}", input.path)))
}

fn note_reclaim(ctx: &ToolContext<'_>, path: &str, acquired: &Acquired) {
    if let Acquired::Reclaimed { previous } = acquired {
        ctx.events.emit(SessionEvent::LockReclaimed {
            path: path.to_string(),
            previous: previous.clone(),
            holder: ctx.worker_id.to_string(),
        });
    }
}

fn parse_priority(value: Option<&str>) -> Result<Priority> {
    match value {
        None => Ok(Priority::default()),
        Some(p) => Priority::parse(p)
            .ok_or_else(|| SwarmError::InvalidInput(format!("Unknown priority: {p}"))),
    }
}

fn create_story(ctx: &mut ToolContext<'_>, input: CreateStoryInput) -> Result<ToolOutput> {
    if input.title.trim().is_empty() {
        return Err(SwarmError::InvalidInput("A story title is required".into()));
    }
    let missing: Vec<&str> = input
        .depends_on
        .iter()
        .filter(|dep| ctx.ledger.story(dep).is_none() && !ctx.ledger.archive().contains(dep))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(SwarmError::InvalidInput(format!(
            "Unknown dependencies: {}",
            missing.join(", ")
        )));
    }
    if let Some(epic_id) = &input.epic_id {
        if ctx.ledger.epic(epic_id).is_none() {
            return Err(SwarmError::InvalidInput(format!("Unknown epic: {epic_id}")));
        }
    }
    if input.foundation {
        if let Some(existing) = ctx.ledger.stories().iter().find(|s| s.foundation) {
            return Err(SwarmError::InvalidInput(format!(
                "Story {} is already the foundation story",
                existing.id
            )));
        }
    }

    let mut story = Story::new(input.title.trim())
        .description(input.description)
        .priority(parse_priority(input.priority.as_deref())?)
        .depends_on(input.depends_on);
    story.acceptance_criteria = input.acceptance_criteria;
    story.epic_id = input.epic_id;
    story.foundation = input.foundation;

    let id = story.id.clone();
    ctx.ledger.insert_story(story)?;
    Ok(ToolOutput::ok(format!("Created story {id}")))
}

fn create_epic(ctx: &mut ToolContext<'_>, input: CreateEpicInput) -> Result<ToolOutput> {
    if input.title.trim().is_empty() {
        return Err(SwarmError::InvalidInput("An epic title is required".into()));
    }
    let id = generate_story_id(Utc::now()).replacen("story-", "epic-", 1);
    let mut epic = Epic::new(id.clone(), input.title.trim());
    epic.description = input.description;
    epic.priority = parse_priority(input.priority.as_deref())?;
    epic.story_ids = input.story_ids;

    for story_id in epic.story_ids.clone() {
        if ctx.ledger.story(&story_id).is_some() {
            ctx.ledger
                .update_story(&story_id, |s| s.epic_id = Some(id.clone()))?;
        }
    }
    ctx.ledger.upsert_epic(epic);
    Ok(ToolOutput::ok(format!("Created epic {id}")))
}

fn get_story(ctx: &mut ToolContext<'_>, input: StoryRef) -> Result<ToolOutput> {
    let story = ctx
        .ledger
        .story(&input.story_id)
        .or_else(|| ctx.ledger.archive().get(&input.story_id))
        .ok_or_else(|| SwarmError::StoryNotFound(input.story_id.clone()))?;
    Ok(ToolOutput::ok(serde_json::to_string_pretty(story)?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorySummary<'a> {
    id: &'a str,
    title: &'a str,
    status: StoryStatus,
    priority: Priority,
    assigned_worker_id: Option<&'a str>,
    retry_count: u32,
    depends_on: Vec<&'a str>,
}

fn list_stories(ctx: &mut ToolContext<'_>, input: ListStoriesInput) -> Result<ToolOutput> {
    let filter = match input.status.as_deref() {
        None => None,
        Some(s) => Some(
            StoryStatus::parse(s)
                .ok_or_else(|| SwarmError::InvalidInput(format!("Unknown status: {s}")))?,
        ),
    };
    let summaries: Vec<StorySummary<'_>> = ctx
        .ledger
        .stories()
        .iter()
        .filter(|s| filter.is_none_or(|f| s.status == f))
        .map(|s| StorySummary {
            id: &s.id,
            title: &s.title,
            status: s.status,
            priority: s.priority,
            assigned_worker_id: s.assigned_worker_id.as_deref(),
            retry_count: s.retry_count,
            depends_on: s.depends_on.iter().map(String::as_str).collect(),
        })
        .collect();
    Ok(ToolOutput::ok(serde_json::to_string_pretty(&summaries)?))
}
