//! Session registry keyed by project directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::Session;
use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};

/// Owns every live session. Sessions are independent; the manager only
/// creates, finds, and stops them.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<PathBuf, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `working_dir`, or a new one resumed from its
    /// latest checkpoint.
    pub async fn get_or_create(&self, working_dir: &Path, config: SwarmConfig) -> Result<Arc<Session>> {
        let key = project_key(working_dir);
        if let Some(session) = self.sessions.read().await.get(&key) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }
        let session = Arc::new(Session::resume(working_dir, config).await?);
        info!(session_id = %session.id(), project = %key.display(), "Session registered");
        sessions.insert(key, session.clone());
        Ok(session)
    }

    pub async fn get(&self, working_dir: &Path) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&project_key(working_dir)).cloned()
    }

    pub async fn get_by_id(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.id() == session_id)
            .cloned()
    }

    /// Stop and forget the session for `working_dir`.
    pub async fn stop(&self, working_dir: &Path) -> Result<()> {
        let key = project_key(working_dir);
        let session = self
            .sessions
            .write()
            .await
            .remove(&key)
            .ok_or_else(|| SwarmError::SessionNotFound(key.display().to_string()))?;
        session.stop().await
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut list: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.created_at().cmp(&b.created_at()));
        list
    }

    /// Stop every session.
    pub async fn shutdown(&self) -> Result<()> {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop().await?;
        }
        Ok(())
    }
}

fn project_key(working_dir: &Path) -> PathBuf {
    std::fs::canonicalize(working_dir).unwrap_or_else(|_| working_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_session_per_project() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();

        let first = manager.get_or_create(a.path(), SwarmConfig::for_project(a.path())).await.unwrap();
        let again = manager.get_or_create(a.path(), SwarmConfig::for_project(a.path())).await.unwrap();
        let other = manager.get_or_create(b.path(), SwarmConfig::for_project(b.path())).await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_ne!(first.id(), other.id());
        assert_eq!(manager.list().await.len(), 2);
        assert!(manager.get_by_id(other.id()).await.is_some());
    }

    #[tokio::test]
    async fn stop_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        manager.get_or_create(dir.path(), SwarmConfig::for_project(dir.path())).await.unwrap();

        manager.stop(dir.path()).await.unwrap();
        assert!(manager.get(dir.path()).await.is_none());
        assert!(matches!(
            manager.stop(dir.path()).await,
            Err(SwarmError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_every_session() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let first = manager.get_or_create(a.path(), SwarmConfig::for_project(a.path())).await.unwrap();
        let second = manager.get_or_create(b.path(), SwarmConfig::for_project(b.path())).await.unwrap();

        manager.shutdown().await.unwrap();

        assert!(manager.list().await.is_empty());
        assert!(first.status().await.stopped);
        assert!(second.status().await.stopped);
    }
}
