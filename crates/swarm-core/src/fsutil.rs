//! Filesystem primitives: atomic replacement and advisory lock files.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Write `contents` to a temp file beside `path`, then rename it over `path`.
///
/// Readers either see the old file or the new one, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json)?;
    Ok(())
}

/// Contents of an advisory lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFileInfo {
    pub holder: String,
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of trying to create an advisory lock file.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(AdvisoryLock),
    /// Someone else holds a fresh lock.
    Held(Option<LockFileInfo>),
}

/// An exclusive lock file, created with `create_new` and removed on drop.
///
/// Cooperating processes see the file and back off; nothing stops a process
/// that ignores it.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    released: bool,
}

impl AdvisoryLock {
    /// Try once to create the lock file. A lock file older than `stale_after`
    /// is removed and the attempt repeated.
    pub fn try_acquire(
        path: &Path,
        holder: &str,
        stale_after: Duration,
    ) -> std::io::Result<LockAttempt> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockFileInfo {
                        holder: holder.to_string(),
                        pid: std::process::id(),
                        acquired_at: chrono::Utc::now(),
                    };
                    let body = serde_json::to_vec(&info).unwrap_or_default();
                    file.write_all(&body)?;
                    return Ok(LockAttempt::Acquired(Self {
                        path: path.to_path_buf(),
                        released: false,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(path).is_some_and(|age| age >= stale_after) {
                        tracing::warn!(path = %path.display(), "Removing stale lock file");
                        match std::fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    return Ok(LockAttempt::Held(read_lock_info(path)));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(LockAttempt::Held(read_lock_info(path)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the lock file's mtime so other processes do not judge it stale.
    pub fn touch(&self) -> std::io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_modified(SystemTime::now())
    }

    /// Remove the lock file now.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn read_lock_info(path: &Path) -> Option<LockFileInfo> {
    let content = std::fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

/// Modification time of a file, if it exists.
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn second_acquire_sees_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let first = AdvisoryLock::try_acquire(&path, "a", Duration::from_secs(30)).unwrap();
        assert!(matches!(first, LockAttempt::Acquired(_)));

        match AdvisoryLock::try_acquire(&path, "b", Duration::from_secs(30)).unwrap() {
            LockAttempt::Held(Some(info)) => assert_eq!(info.holder, "a"),
            other => panic!("expected held lock, got {other:?}"),
        }
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        let first = AdvisoryLock::try_acquire(&path, "a", Duration::ZERO).unwrap();
        let LockAttempt::Acquired(first) = first else {
            panic!("first acquire failed");
        };
        std::mem::forget(first);

        let second = AdvisoryLock::try_acquire(&path, "b", Duration::ZERO).unwrap();
        assert!(matches!(second, LockAttempt::Acquired(_)));
    }
}
