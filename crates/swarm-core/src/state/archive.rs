//! Append-only archive of terminal stories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::story::Story;
use crate::fsutil;

/// On-disk archive shape. `archived_at[i]` is when `tasks[i]` was archived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFile {
    #[serde(default)]
    pub tasks: Vec<Story>,
    #[serde(default)]
    pub archived_at: Vec<DateTime<Utc>>,
}

/// Secondary store holding stories moved out of the active ledger.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
    file: ArchiveFile,
    ids: HashSet<String>,
}

impl ArchiveStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: ArchiveFile::default(),
            ids: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the archive from disk. Missing file is an empty archive. A corrupt
    /// one is moved aside to `<name>.corrupt-<millis>` and treated as empty, so
    /// the next write cannot overwrite its history.
    pub fn read(path: &Path) -> std::io::Result<ArchiveFile> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArchiveFile::default()),
            Err(e) => return Err(e),
        };
        match serde_json::from_str::<ArchiveFile>(&content) {
            Ok(mut file) => {
                // Older files may carry fewer timestamps than tasks.
                let fill = file.archived_at.last().copied().unwrap_or_else(Utc::now);
                file.archived_at.resize(file.tasks.len(), fill);
                Ok(file)
            }
            Err(e) => {
                let aside = corrupt_path(path, Utc::now());
                std::fs::rename(path, &aside)?;
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Archive file is corrupt, moved aside"
                );
                Ok(ArchiveFile::default())
            }
        }
    }

    pub fn replace(&mut self, file: ArchiveFile) {
        self.ids = file.tasks.iter().map(|s| s.id.clone()).collect();
        self.file = file;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.file.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.tasks.is_empty()
    }

    pub fn stories(&self) -> &[Story] {
        &self.file.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Story> {
        self.file.tasks.iter().find(|s| s.id == id)
    }

    /// Append a story unless its id is already archived. Returns whether it
    /// was added.
    pub fn append(&mut self, story: Story, at: DateTime<Utc>) -> bool {
        if !self.ids.insert(story.id.clone()) {
            return false;
        }
        self.file.tasks.push(story);
        self.file.archived_at.push(at);
        true
    }

    pub fn write(&self) -> crate::Result<()> {
        fsutil::atomic_write_json(&self.path, &self.file)
    }
}

fn corrupt_path(path: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", at.timestamp_millis()));
    PathBuf::from(name)
}
