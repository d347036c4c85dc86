//! File-based session store.
//!
//! Each session is one pretty-printed JSON document at
//! `<sessions_dir>/<session_id>.json`. Writes go through a temp file and
//! an atomic rename to prevent corruption.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::warn;

use crate::session::AgentSession;

use super::error::{StorageError, StorageResult};
use super::session::SessionStore;

/// Session store that persists snapshots under a single directory.
pub struct FileSessionStore {
    sessions_dir: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    async fn ensure_dir(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.sessions_dir)
            .await
            .map_err(|e| StorageError::file_io(&self.sessions_dir, e))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &AgentSession) -> StorageResult<()> {
        self.ensure_dir().await?;

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        // Write to temp file first, then atomic rename.
        let final_path = self.snapshot_path(&session.session_id);
        let temp_path = self
            .sessions_dir
            .join(format!("{}.json.tmp", session.session_id));

        fs::write(&temp_path, &json)
            .await
            .map_err(|e| StorageError::file_io(&temp_path, e))?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StorageError::file_io(&final_path, e))?;

        Ok(())
    }

    async fn load(&self, session_id: &str) -> StorageResult<Option<AgentSession>> {
        let path = self.snapshot_path(session_id);

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        let session = serde_json::from_slice(&contents)
            .map_err(|e| StorageError::file_deserialization(&path, e.to_string()))?;
        Ok(Some(session))
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::file_io(&self.sessions_dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&self.sessions_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, session_id: &str) -> StorageResult<bool> {
        let path = self.snapshot_path(session_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut entries = match fs::read_dir(&self.sessions_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::file_io(&self.sessions_dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&self.sessions_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                    continue;
                }
            };

            if DateTime::<Utc>::from(modified) < cutoff {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove old snapshot");
                    }
                }
            }
        }

        Ok(removed)
    }
}
