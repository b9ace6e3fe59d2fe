//! Per-path write locks for the shared project tree.
//!
//! Holds are recorded twice: as advisory lock files under the locks directory
//! (visible to other processes) and in an in-memory holder map. Acquisition
//! never queues; a conflicting hold is reported immediately.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::fsutil::{self, AdvisoryLock, LockAttempt};

/// Public view of a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub path: PathBuf,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// How an acquire succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Fresh,
    /// Same holder already held the path; the hold was refreshed.
    Refreshed,
    /// A stale hold by another holder was force-reclaimed.
    Reclaimed { previous: String },
}

#[derive(Debug)]
struct Hold {
    holder: String,
    acquired_at: DateTime<Utc>,
    since: Instant,
    file: AdvisoryLock,
}

/// Mutual exclusion for writes into the project tree.
#[derive(Debug)]
pub struct FileLockManager {
    root: PathBuf,
    locks_dir: PathBuf,
    stale_after: Duration,
    holds: Mutex<HashMap<PathBuf, Hold>>,
}

impl FileLockManager {
    pub fn new(root: &Path, locks_dir: &Path, stale_after: Duration) -> Self {
        Self {
            root: normalize(root),
            locks_dir: locks_dir.to_path_buf(),
            stale_after,
            holds: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(root: &Path, config: &SwarmConfig) -> Self {
        Self::new(root, &config.locks_dir, config.locks.stale_after())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the lock on `path` for `holder`, failing fast with
    /// [`SwarmError::LockConflict`] if someone else holds a fresh lock.
    pub fn acquire(&self, path: &Path, holder: &str) -> Result<Acquired> {
        let key = self.resolve(path)?;
        let mut holds = self.holds();
        let mut reclaimed = None;

        if let Some(existing) = holds.get_mut(&key) {
            if existing.holder == holder {
                existing.since = Instant::now();
                existing.acquired_at = Utc::now();
                if let Err(e) = existing.file.touch() {
                    warn!(path = %key.display(), error = %e, "Could not touch lock file");
                }
                debug!(path = %key.display(), holder, "Lock refreshed");
                return Ok(Acquired::Refreshed);
            }
            if existing.since.elapsed() < self.stale_after {
                return Err(SwarmError::LockConflict {
                    path: key,
                    holder: existing.holder.clone(),
                    acquired_at: existing.acquired_at,
                });
            }
            warn!(
                path = %key.display(),
                previous = %existing.holder,
                holder,
                age_secs = existing.since.elapsed().as_secs(),
                "Reclaiming stale lock"
            );
            reclaimed = holds.remove(&key).map(|h| h.holder);
        }

        let lock_file = self.lock_file_for(&key);
        let file = match AdvisoryLock::try_acquire(&lock_file, holder, self.stale_after)? {
            LockAttempt::Acquired(file) => file,
            LockAttempt::Held(info) => {
                let (other, acquired_at) = info
                    .map(|i| (i.holder, i.acquired_at))
                    .unwrap_or_else(|| ("unknown".to_string(), Utc::now()));
                return Err(SwarmError::LockConflict {
                    path: key,
                    holder: other,
                    acquired_at,
                });
            }
        };

        holds.insert(
            key.clone(),
            Hold {
                holder: holder.to_string(),
                acquired_at: Utc::now(),
                since: Instant::now(),
                file,
            },
        );
        info!(path = %key.display(), holder, "Lock acquired");

        Ok(match reclaimed {
            Some(previous) => Acquired::Reclaimed { previous },
            None => Acquired::Fresh,
        })
    }

    /// Release `path` if `holder` holds it. Returns whether a hold was removed.
    pub fn release(&self, path: &Path, holder: &str) -> bool {
        let Ok(key) = self.resolve(path) else {
            return false;
        };
        let mut holds = self.holds();
        match holds.get(&key) {
            Some(hold) if hold.holder == holder => {
                holds.remove(&key);
                debug!(path = %key.display(), holder, "Lock released");
                true
            }
            _ => false,
        }
    }

    /// Release every hold owned by `holder`.
    pub fn release_all_for(&self, holder: &str) -> usize {
        let mut holds = self.holds();
        let before = holds.len();
        holds.retain(|_, h| h.holder != holder);
        let released = before - holds.len();
        if released > 0 {
            debug!(holder, released, "Released holder's locks");
        }
        released
    }

    /// Release every hold (session stop).
    pub fn release_all(&self) -> usize {
        let mut holds = self.holds();
        let count = holds.len();
        holds.clear();
        if count > 0 {
            info!(count, "Released all file locks");
        }
        count
    }

    pub fn holder_of(&self, path: &Path) -> Option<String> {
        let key = self.resolve(path).ok()?;
        self.holds().get(&key).map(|h| h.holder.clone())
    }

    /// Snapshot of all current holds, sorted by path.
    pub fn holders(&self) -> Vec<LockInfo> {
        let mut list: Vec<LockInfo> = self
            .holds()
            .iter()
            .map(|(path, hold)| LockInfo {
                path: path.clone(),
                holder: hold.holder.clone(),
                acquired_at: hold.acquired_at,
            })
            .collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    /// Write a file under a scoped lock: temp file, then atomic rename.
    ///
    /// If `holder` already held the path the hold is kept afterwards;
    /// otherwise it is released on every exit path.
    pub fn write_file(&self, path: &Path, holder: &str, contents: &[u8]) -> Result<Acquired> {
        let scope = self.scoped(path, holder)?;
        fsutil::atomic_write(&scope.absolute, contents)?;
        info!(path = %scope.key.display(), holder, bytes = contents.len(), "File written");
        Ok(scope.acquired.clone())
    }

    /// Replace exactly one occurrence of `old` with `new` under a scoped lock.
    pub fn edit_file(&self, path: &Path, holder: &str, old: &str, new: &str) -> Result<Acquired> {
        if old.is_empty() {
            return Err(SwarmError::InvalidInput("old_string must not be empty".into()));
        }
        let scope = self.scoped(path, holder)?;
        let content = std::fs::read_to_string(&scope.absolute)?;
        let matches = content.matches(old).count();
        if matches != 1 {
            return Err(SwarmError::InvalidInput(format!(
                "Expected exactly one match in {}, found {}",
                scope.key.display(),
                matches
            )));
        }
        let updated = content.replacen(old, new, 1);
        fsutil::atomic_write(&scope.absolute, updated.as_bytes())?;
        info!(path = %scope.key.display(), holder, "File edited");
        Ok(scope.acquired.clone())
    }

    /// Read a file inside the project tree. Reads take no lock; writers
    /// replace files atomically.
    pub fn read_file(&self, path: &Path) -> Result<String> {
        let key = self.resolve(path)?;
        Ok(std::fs::read_to_string(self.root.join(key))?)
    }

    fn scoped(&self, path: &Path, holder: &str) -> Result<Scope<'_>> {
        let key = self.resolve(path)?;
        let acquired = self.acquire(&key, holder)?;
        Ok(Scope {
            manager: self,
            absolute: self.root.join(&key),
            release_on_drop: acquired != Acquired::Refreshed,
            key,
            holder: holder.to_string(),
            acquired,
        })
    }

    /// Project-relative, lexically normalized key for `path`.
    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let joined = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.root.join(path))
        };
        match joined.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => Ok(rel.to_path_buf()),
            _ => Err(SwarmError::PathOutsideProject(path.to_path_buf())),
        }
    }

    fn lock_file_for(&self, key: &Path) -> PathBuf {
        self.locks_dir.join(lock_file_name(key))
    }

    fn holds(&self) -> MutexGuard<'_, HashMap<PathBuf, Hold>> {
        self.holds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A lock held for the duration of one write.
struct Scope<'a> {
    manager: &'a FileLockManager,
    key: PathBuf,
    absolute: PathBuf,
    holder: String,
    acquired: Acquired,
    release_on_drop: bool,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if self.release_on_drop {
            // No-op if the hold was reclaimed by someone else meanwhile.
            self.manager.release(&self.key, &self.holder);
        }
    }
}

/// Flat lock file name for a project-relative path. `%` is escaped first so
/// the separator escape cannot be forged by a file name.
pub fn lock_file_name(key: &Path) -> String {
    let parts: Vec<String> = key
        .components()
        .map(|c| c.as_os_str().to_string_lossy().replace('%', "%25"))
        .collect();
    format!("{}.lock", parts.join("%2F"))
}

/// Inverse of [`lock_file_name`]; `None` for files that are not lock files.
pub fn path_from_lock_file(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".lock")?;
    Some(stem.replace("%2F", "/").replace("%25", "%"))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
