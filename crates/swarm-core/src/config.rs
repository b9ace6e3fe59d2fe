//! Kernel configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main kernel configuration, loaded from .swarm/config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Config version
    pub version: Option<String>,

    /// Worker pool sizes per role
    #[serde(default)]
    pub pools: PoolConfig,

    /// Failed test runs allowed before a story is parked
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How far before session start an id timestamp may be (clock skew)
    #[serde(default = "default_stale_tolerance")]
    pub stale_insertion_tolerance_secs: u64,

    /// Delay between event loop ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// File lock configuration
    #[serde(default)]
    pub locks: LockConfig,

    /// Ledger persistence retry policy
    #[serde(default)]
    pub persistence: RetryPolicy,

    /// Checkpoint retention and cadence
    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    /// Archive retention
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Ledger file (relative to project root)
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Archive file for terminal stories
    #[serde(default = "default_archive_path")]
    pub archive_path: PathBuf,

    /// Directory for versioned checkpoints
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: PathBuf,

    /// Directory for advisory lock files
    #[serde(default = "default_locks_dir")]
    pub locks_dir: PathBuf,

    /// Append-only event log
    #[serde(default = "default_events_path")]
    pub events_path: PathBuf,
}

/// Number of concurrent workers per role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_coders")]
    pub coder: usize,

    #[serde(default = "default_testers")]
    pub tester: usize,

    /// Remediation workers; 0 routes remediation stories to coders
    #[serde(default = "default_fixers")]
    pub fixer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            coder: default_coders(),
            tester: default_testers(),
            fixer: default_fixers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Holds older than this may be reclaimed by another holder
    #[serde(default = "default_lock_stale_secs")]
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_lock_stale_secs(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// A policy that tries once and never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Snapshots retained by prune
    #[serde(default = "default_checkpoint_keep")]
    pub keep: usize,

    /// Ticks between automatic checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub interval_ticks: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            keep: default_checkpoint_keep(),
            interval_ticks: default_checkpoint_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Terminal stories kept in the active ledger when archiving
    #[serde(default)]
    pub keep_recent: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_stale_tolerance() -> u64 {
    3600
}
fn default_tick_interval() -> u64 {
    1000
}
fn default_coders() -> usize {
    2
}
fn default_testers() -> usize {
    1
}
fn default_fixers() -> usize {
    1
}
fn default_lock_stale_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    1000
}
fn default_checkpoint_keep() -> usize {
    10
}
fn default_checkpoint_interval() -> u64 {
    30
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from(".swarm/ledger.json")
}
fn default_archive_path() -> PathBuf {
    PathBuf::from(".swarm/archive.json")
}
fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from(".swarm/checkpoints")
}
fn default_locks_dir() -> PathBuf {
    PathBuf::from(".swarm/locks")
}
fn default_events_path() -> PathBuf {
    PathBuf::from(".swarm/events.jsonl")
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            version: None,
            pools: PoolConfig::default(),
            max_retries: default_max_retries(),
            stale_insertion_tolerance_secs: default_stale_tolerance(),
            tick_interval_ms: default_tick_interval(),
            locks: LockConfig::default(),
            persistence: RetryPolicy::default(),
            checkpoints: CheckpointConfig::default(),
            archive: ArchiveConfig::default(),
            ledger_path: default_ledger_path(),
            archive_path: default_archive_path(),
            checkpoints_dir: default_checkpoints_dir(),
            locks_dir: default_locks_dir(),
            events_path: default_events_path(),
        }
    }
}

impl SwarmConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .swarm/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".swarm/config.yaml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.ledger_path = project_root.join(&self.ledger_path);
        self.archive_path = project_root.join(&self.archive_path);
        self.checkpoints_dir = project_root.join(&self.checkpoints_dir);
        self.locks_dir = project_root.join(&self.locks_dir);
        self.events_path = project_root.join(&self.events_path);
    }

    /// Default config resolved against a project root.
    pub fn for_project(project_root: &Path) -> Self {
        let mut config = Self::default();
        config.resolve_paths(project_root);
        config
    }

    pub fn stale_insertion_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_insertion_tolerance_secs as i64)
    }

    /// Loop period; never zero.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policies() {
        let config = SwarmConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.locks.stale_after_secs, 30);
        assert_eq!(config.persistence.max_attempts, 5);
        assert_eq!(config.stale_insertion_tolerance_secs, 3600);
    }

    #[test]
    fn zero_tick_interval_is_clamped() {
        let mut config = SwarmConfig::default();
        config.tick_interval_ms = 0;
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "pools:\n  coder: 4\nlocks:\n  stale_after_secs: 5\n";
        let config: SwarmConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pools.coder, 4);
        assert_eq!(config.pools.tester, 1);
        assert_eq!(config.locks.stale_after_secs, 5);
        assert_eq!(config.ledger_path, PathBuf::from(".swarm/ledger.json"));
    }

    #[test]
    fn resolve_paths_joins_project_root() {
        let config = SwarmConfig::for_project(Path::new("/work/app"));
        assert_eq!(config.ledger_path, PathBuf::from("/work/app/.swarm/ledger.json"));
        assert_eq!(config.locks_dir, PathBuf::from("/work/app/.swarm/locks"));
    }
}
