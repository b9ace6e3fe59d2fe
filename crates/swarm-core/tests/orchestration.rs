//! End-to-end orchestration scenarios against a real project directory.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use swarm_core::config::RetryPolicy;
use swarm_core::session::RunExit;
use swarm_core::state::LedgerFile;
use swarm_core::{
    Priority, Session, Story, StoryStatus, SwarmConfig, ToolRequest, WorkerCapability, WorkerContext,
    WorkerRole,
};

fn config(dir: &Path) -> SwarmConfig {
    let mut config = SwarmConfig::for_project(dir);
    config.persistence = RetryPolicy::no_retry();
    config.tick_interval_ms = 5;
    config
}

async fn create_story(session: &Session, input: serde_json::Value) -> String {
    let out = session
        .invoke("planner", &ToolRequest::new("create_story", input))
        .await;
    assert!(!out.is_error, "{}", out.text);
    out.text.trim_start_matches("Created story ").lines().next().unwrap().to_string()
}

fn failing_report(story_id: &str) -> ToolRequest {
    ToolRequest::new(
        "report_test_results",
        json!({"storyId": story_id, "passed": false, "total": 5, "passedCount": 3, "failedCount": 2,
               "errorOutput": "expected 200, got 500"}),
    )
}

/// Two starts racing for one story
#[tokio::test]
async fn concurrent_start_story_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let session = Arc::new(Session::create(dir.path(), config(dir.path())).await.unwrap());
    let id = create_story(&session, json!({"title": "Login"})).await;

    let request = ToolRequest::new("start_story", json!({"storyId": id}));
    let (a, b) = tokio::join!(
        session.invoke("coder-1", &request),
        session.invoke("coder-2", &request)
    );

    let (winner, loser, holder) = if a.is_error {
        (b, a, "coder-2")
    } else {
        (a, b, "coder-1")
    };
    assert!(!winner.is_error, "{}", winner.text);
    assert_eq!(loser.text, format!("Story {id} is being worked on by {holder}"));

    let story = session.story(&id).await.unwrap();
    assert_eq!(story.status, StoryStatus::InProgress);
    assert_eq!(story.assigned_worker_id.as_deref(), Some(holder));
}

/// A holds a.txt; B's write fails fast and A keeps the lock
#[tokio::test]
async fn write_file_conflict_leaves_holder_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    session.locks().acquire(Path::new("a.txt"), "coder-1").unwrap();

    let started = std::time::Instant::now();
    let out = session
        .invoke("coder-2", &ToolRequest::new("write_file", json!({"path": "a.txt", "content": "B"})))
        .await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(out.is_error);
    assert!(out.text.contains("held by coder-1"), "{}", out.text);

    let holders = session.locks().holders();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].holder, "coder-1");

    let own = session
        .invoke("coder-1", &ToolRequest::new("write_file", json!({"path": "a.txt", "content": "A"})))
        .await;
    assert!(!own.is_error, "{}", own.text);
    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "A");
    assert_eq!(session.locks().holder_of(Path::new("a.txt")).as_deref(), Some("coder-1"));
}

/// Three failing test runs park the story and spawn a remediation story
#[tokio::test]
async fn repeated_failures_park_and_remediate() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    let id = create_story(&session, json!({"title": "Checkout", "acceptanceCriteria": ["pays"]})).await;

    for attempt in 1..=3u32 {
        session.invoke("coder-1", &ToolRequest::new("start_story", json!({"storyId": id}))).await;
        session
            .invoke("coder-1", &ToolRequest::new("mark_ready_for_testing", json!({"storyId": id})))
            .await;
        let out = session.invoke("tester-1", &failing_report(&id)).await;
        assert!(!out.is_error, "{}", out.text);

        let story = session.story(&id).await.unwrap();
        assert_eq!(story.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(story.status, StoryStatus::Backlog);
        } else {
            assert_eq!(story.status, StoryStatus::Failed);
            assert!(out.text.contains("parked"));
        }
    }

    let stories = session.stories().await;
    let fix = stories
        .iter()
        .find(|s| s.remediation_of.as_deref() == Some(id.as_str()))
        .expect("remediation story");
    assert_eq!(fix.priority, Priority::High);
    assert_eq!(fix.status, StoryStatus::Backlog);
    assert!(fix.description.contains("expected 200, got 500"));

    let tick = session.tick().await.unwrap();
    assert_eq!(tick.assigned.len(), 1);
    assert_eq!(tick.assigned[0].story_id, fix.id);
    assert_eq!(tick.assigned[0].role, WorkerRole::Fixer);

    let on_disk: LedgerFile =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(".swarm/ledger.json")).unwrap())
            .unwrap();
    assert_eq!(on_disk.tasks.len(), 2);
}

/// Checkpoint then resume: done stories are untouched, in-flight ones reset
#[tokio::test]
async fn checkpoint_resume_resets_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    let done = create_story(&session, json!({"title": "Docs"})).await;
    let testing = create_story(&session, json!({"title": "Login"})).await;
    let coding = create_story(&session, json!({"title": "Signup"})).await;

    session
        .invoke("coder-1", &ToolRequest::new("skip_testing", json!({"storyId": done, "reason": "docs only"})))
        .await;
    session.invoke("coder-1", &ToolRequest::new("start_story", json!({"storyId": testing}))).await;
    session
        .invoke("coder-1", &ToolRequest::new("mark_ready_for_testing", json!({"storyId": testing})))
        .await;
    session.invoke("coder-2", &ToolRequest::new("start_story", json!({"storyId": coding}))).await;

    let before = session.story(&done).await.unwrap();
    session.checkpoint().await.unwrap();
    session.stop().await.unwrap();

    let resumed = Session::resume(dir.path(), config(dir.path())).await.unwrap();
    assert_eq!(
        serde_json::to_string(&resumed.story(&done).await.unwrap()).unwrap(),
        serde_json::to_string(&before).unwrap()
    );
    for id in [&testing, &coding] {
        let story = resumed.story(id).await.unwrap();
        assert_eq!(story.status, StoryStatus::Backlog);
        assert_eq!(story.assigned_worker_id, None);
    }
    assert!(resumed.status().await.workers.iter().all(|w| w.is_idle()));
}

/// Stories written by another process are ingested unless they predate the
/// session by more than the tolerance
#[tokio::test]
async fn external_stale_stories_are_not_ingested() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    create_story(&session, json!({"title": "Existing"})).await;

    let ledger_path = dir.path().join(".swarm/ledger.json");
    let mut file: LedgerFile = serde_json::from_str(&std::fs::read_to_string(&ledger_path).unwrap()).unwrap();
    let old = session.created_at() - chrono::Duration::hours(2);
    let stale = Story::with_id(format!("story-{}-deadbeef", old.timestamp_millis()), "Old");
    let fresh = Story::with_id(format!("story-{}-cafef00d", Utc::now().timestamp_millis()), "New");
    file.tasks.push(stale.clone());
    file.tasks.push(fresh.clone());
    std::fs::write(&ledger_path, serde_json::to_vec(&file).unwrap()).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&ledger_path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(2))
        .unwrap();

    let tick = session.tick().await.unwrap();
    assert_eq!(tick.ingested, 1);
    assert_eq!(tick.stale, 1);
    assert!(session.story(&stale.id).await.is_none());
    assert!(session.story(&fresh.id).await.is_some());
}

/// A story finished by another process frees its worker for the backlog
#[tokio::test]
async fn externally_finished_story_frees_its_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.pools.coder = 1;
    let session = Session::create(dir.path(), config).await.unwrap();
    let first = create_story(&session, json!({"title": "First", "priority": "high"})).await;
    let second = create_story(&session, json!({"title": "Second", "priority": "low"})).await;

    let tick = session.tick().await.unwrap();
    assert_eq!(tick.assigned.len(), 1);
    assert_eq!(tick.assigned[0].story_id, first);

    let ledger_path = dir.path().join(".swarm/ledger.json");
    let mut file: LedgerFile = serde_json::from_str(&std::fs::read_to_string(&ledger_path).unwrap()).unwrap();
    let story = file.tasks.iter_mut().find(|s| s.id == first).unwrap();
    story.status = StoryStatus::Done;
    story.assigned_worker_id = None;
    std::fs::write(&ledger_path, serde_json::to_vec(&file).unwrap()).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&ledger_path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(2))
        .unwrap();

    let tick = session.tick().await.unwrap();
    assert_eq!(session.story(&first).await.unwrap().status, StoryStatus::Done);
    assert_eq!(tick.assigned.len(), 1);
    assert_eq!(tick.assigned[0].story_id, second);
    assert_eq!(session.story(&second).await.unwrap().status, StoryStatus::InProgress);
}

/// Archiving is idempotent and the counts stay balanced
#[tokio::test]
async fn archive_keeps_counts_balanced() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    for title in ["a", "b", "c"] {
        let id = create_story(&session, json!({"title": title})).await;
        session
            .invoke("coder-1", &ToolRequest::new("skip_testing", json!({"storyId": id, "reason": "trivial"})))
            .await;
    }
    create_story(&session, json!({"title": "open"})).await;

    let first = session.archive(Some(1)).await.unwrap();
    let second = session.archive(Some(1)).await.unwrap();
    assert_eq!(first.archived.len(), 2);
    assert!(second.archived.is_empty());

    let counts = session.status().await.counts;
    assert_eq!(counts.active + counts.archived, counts.total);
    assert_eq!(counts.total, 4);
}

/// Scripted workers: coders write a file and hand off, testers pass
struct Scripted;

#[async_trait]
impl WorkerCapability for Scripted {
    async fn propose(&self, ctx: &WorkerContext) -> anyhow::Result<Vec<ToolRequest>> {
        let id = &ctx.story.id;
        Ok(match ctx.role {
            WorkerRole::Coder | WorkerRole::Fixer if ctx.story.status == StoryStatus::InProgress => vec![
                ToolRequest::new("write_file", json!({"path": format!("out/{id}.txt"), "content": ctx.story.title})),
                ToolRequest::new("mark_ready_for_testing", json!({"storyId": id})),
            ],
            WorkerRole::Tester => vec![ToolRequest::new(
                "report_test_results",
                json!({"storyId": id, "passed": true, "total": 1, "passedCount": 1, "failedCount": 0}),
            )],
            _ => Vec::new(),
        })
    }
}

#[tokio::test]
async fn run_loop_drives_stories_to_done() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::create(dir.path(), config(dir.path())).await.unwrap();
    let base = create_story(&session, json!({"title": "Scaffold", "foundation": true})).await;
    let feature = create_story(&session, json!({"title": "Feature", "dependsOn": [base]})).await;
    let (_tx, rx) = watch::channel(false);

    let exit = tokio::time::timeout(Duration::from_secs(10), session.run(Arc::new(Scripted), rx))
        .await
        .expect("run loop finished in time")
        .unwrap();

    assert_eq!(exit, RunExit::Finished);
    for id in [&base, &feature] {
        assert_eq!(session.story(id).await.unwrap().status, StoryStatus::Done);
        assert!(dir.path().join(format!("out/{id}.txt")).exists());
    }
    assert!(session.locks().holders().is_empty());
}
