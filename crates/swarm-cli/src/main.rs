//! Swarm CLI - multi-worker story orchestration.
//!
//! Single binary that provides:
//! - `swarm init` - create `.swarm/` state for a project
//! - `swarm status` - ledger, worker, lock, and checkpoint overview
//! - `swarm invoke` - run one operation as a worker
//! - `swarm schedule` - run scheduling ticks
//! - `swarm archive` / `swarm checkpoint` - maintenance

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use swarm_core::{
    checkpoint::CheckpointStore,
    kernel::Scheduler,
    locks, observability,
    state::{LedgerFile, StoryStore, TaskLedger},
    Session, SwarmConfig, ToolRequest,
};

#[derive(Parser)]
#[command(name = "swarm")]
#[command(about = "Multi-worker story orchestration kernel", version)]
struct Cli {
    /// Project root directory
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project
    Init,

    /// Show session status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one operation as a worker
    Invoke {
        /// Calling worker id (e.g. coder-1)
        worker: String,

        /// Operation name (e.g. start_story)
        operation: String,

        /// JSON input
        #[arg(default_value = "{}")]
        input: String,
    },

    /// Reconcile the ledger and assign eligible stories
    Schedule {
        /// Number of ticks to run
        #[arg(long, default_value_t = 1)]
        ticks: u32,
    },

    /// Move done stories to the archive
    Archive {
        /// Done stories to keep in the active ledger
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Checkpoint management
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Write a checkpoint of the current ledger
    Save,

    /// Show a checkpoint (latest by default)
    Show {
        #[arg(long)]
        version: Option<u64>,
    },

    /// List checkpoint versions
    Ls,

    /// Delete all but the newest checkpoints
    Prune {
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Find project root
    let project_root = match cli.project {
        Some(p) => p,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Init => init_project(&project_root),
        Commands::Status { json } => show_status(&project_root, json).await,
        Commands::Invoke {
            worker,
            operation,
            input,
        } => invoke(&project_root, &worker, &operation, &input).await,
        Commands::Schedule { ticks } => schedule(&project_root, ticks).await,
        Commands::Archive { keep } => archive(&project_root, keep).await,
        Commands::Checkpoint { command } => handle_checkpoint(&project_root, command).await,
    }
}

fn load_config(project_root: &Path) -> Result<SwarmConfig> {
    let mut config = SwarmConfig::load_from_project(project_root)?;
    config.resolve_paths(project_root);
    Ok(config)
}

async fn show_status(project_root: &Path, json: bool) -> Result<()> {
    let config = load_config(project_root)?;
    let ledger = TaskLedger::open(&config, chrono::Utc::now()).await?;
    let checkpoints = CheckpointStore::new(&config.checkpoints_dir);
    let latest = checkpoints.load().await?;

    let mut scheduler = Scheduler::from_config(&config);
    if let Some(checkpoint) = &latest {
        scheduler.restore_state(checkpoint.scheduler.clone());
    }
    let ready: Vec<String> = scheduler
        .ready_stories(&ledger)
        .into_iter()
        .map(|s| s.id.clone())
        .collect();
    let lock_files = list_lock_files(&config.locks_dir);
    let recent_events = observability::read_recent(&config.events_path, 5);
    let counts = ledger.counts();

    if json {
        let status = serde_json::json!({
            "project": project_root.display().to_string(),
            "counts": counts,
            "ready": ready,
            "locks": lock_files,
            "latestCheckpoint": latest.as_ref().map(|c| c.version),
            "recentEvents": recent_events,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Swarm Status");
    println!("============");
    println!();
    println!("Project: {}", project_root.display());
    println!();
    println!(
        "Stories: {} active, {} archived, {} total",
        counts.active, counts.archived, counts.total
    );
    for story in ledger.stories() {
        let worker = story.assigned_worker_id.as_deref().unwrap_or("-");
        println!("  - {} [{}] {} ({})", story.id, story.status, story.title, worker);
    }
    println!();
    println!("Ready stories: {}", ready.len());
    for id in ready.iter().take(5) {
        println!("  - {}", id);
    }
    if ready.len() > 5 {
        println!("  ... and {} more", ready.len() - 5);
    }
    println!();
    println!("Locks: {} held", lock_files.len());
    for lock in &lock_files {
        println!("  - {}", lock);
    }
    println!();
    match &latest {
        Some(c) => println!("Latest checkpoint: v{} ({}, {})", c.version, c.phase.as_str(), c.timestamp),
        None => println!("Latest checkpoint: none"),
    }
    println!();
    println!("Recent events:");
    for record in &recent_events {
        println!("  [{}] {}", record.timestamp.format("%H:%M:%S"), record.event.kind());
    }

    Ok(())
}

fn list_lock_files(locks_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(locks_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .filter_map(|name| locks::path_from_lock_file(&name))
        .collect();
    names.sort();
    names
}

async fn invoke(project_root: &Path, worker: &str, operation: &str, input: &str) -> Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(input).with_context(|| format!("Invalid JSON input: {}", input))?;
    let config = load_config(project_root)?;
    let session = Session::create(project_root, config).await?;

    let output = session
        .invoke(worker, &ToolRequest::new(operation, input))
        .await;
    if output.is_error {
        bail!("{}", output.text);
    }
    println!("{}", output.text);
    Ok(())
}

async fn schedule(project_root: &Path, ticks: u32) -> Result<()> {
    let config = load_config(project_root)?;
    let session = Session::create(project_root, config).await?;

    for _ in 0..ticks {
        let report = session.tick().await?;
        for assignment in &report.assigned {
            println!(
                "{} -> {} ({})",
                assignment.story_id, assignment.worker_id, assignment.role
            );
        }
        if report.assigned.is_empty() {
            println!("No eligible stories");
            break;
        }
    }
    Ok(())
}

async fn archive(project_root: &Path, keep: Option<usize>) -> Result<()> {
    let config = load_config(project_root)?;
    let session = Session::create(project_root, config).await?;
    let report = session.archive(keep).await?;
    println!(
        "Archived {} stories ({} done stories kept active)",
        report.archived.len(),
        report.retained
    );
    Ok(())
}

async fn handle_checkpoint(project_root: &Path, command: CheckpointCommands) -> Result<()> {
    let config = load_config(project_root)?;
    let store = CheckpointStore::new(&config.checkpoints_dir);

    match command {
        CheckpointCommands::Save => {
            let session = Session::create(project_root, config).await?;
            let checkpoint = session.checkpoint().await?;
            println!(
                "Saved checkpoint v{} ({} stories, phase {})",
                checkpoint.version,
                checkpoint.ledger.stories.len(),
                checkpoint.phase.as_str()
            );
        }
        CheckpointCommands::Show { version } => {
            let checkpoint = match version {
                Some(v) => store.load_version(v).await?,
                None => store.load().await?,
            };
            match checkpoint {
                Some(c) => println!("{}", serde_json::to_string_pretty(&c)?),
                None => bail!("No checkpoint found in {}", store.dir().display()),
            }
        }
        CheckpointCommands::Ls => {
            let versions = store.list().await?;
            println!("Checkpoints: {}", versions.len());
            for v in versions {
                println!("  v{}", v);
            }
        }
        CheckpointCommands::Prune { keep } => {
            let keep = keep.unwrap_or(config.checkpoints.keep);
            let removed = store.prune(keep).await?;
            println!("Removed {} checkpoints, kept newest {}", removed.len(), keep);
        }
    }

    Ok(())
}

fn init_project(project_root: &Path) -> Result<()> {
    let swarm_dir = project_root.join(".swarm");
    std::fs::create_dir_all(&swarm_dir)?;

    // Create default config
    let config_path = swarm_dir.join("config.yaml");
    if !config_path.exists() {
        let default_config = r#"# Swarm Configuration

pools:
  coder: 2
  tester: 1
  fixer: 1

max_retries: 3
stale_insertion_tolerance_secs: 3600
tick_interval_ms: 1000

locks:
  stale_after_secs: 30

persistence:
  max_attempts: 5
  initial_backoff_ms: 100
  max_backoff_ms: 1000

checkpoints:
  keep: 10
  interval_ticks: 30

archive:
  keep_recent: 0
"#;
        std::fs::write(&config_path, default_config)?;
    }

    // Create empty ledger
    let ledger_path = swarm_dir.join("ledger.json");
    if !ledger_path.exists() {
        let empty = LedgerFile {
            last_updated: Some(chrono::Utc::now()),
            ..LedgerFile::default()
        };
        std::fs::write(&ledger_path, serde_json::to_vec_pretty(&empty)?)?;
    }

    println!("Initialized swarm project at {}", project_root.display());
    println!();
    println!("Created:");
    println!("  .swarm/config.yaml - orchestration configuration");
    println!("  .swarm/ledger.json - story ledger");
    println!();
    println!("Next steps:");
    println!("  1. swarm invoke planner create_story '{{\"title\": \"...\"}}'");
    println!("  2. swarm schedule");

    Ok(())
}
