//! Session storage trait.
//!
//! Defines the interface for persisting session snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::session::AgentSession;

use super::error::StorageResult;

/// Storage interface for session snapshots.
///
/// Snapshots are whole-session documents; there is no partial update.
/// A missing snapshot is not an error: `load` returns `Ok(None)` and
/// `delete` returns `Ok(false)`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save a snapshot of the session, replacing any previous one.
    ///
    /// Must be atomic, either fully succeeds or has no effect.
    async fn save(&self, session: &AgentSession) -> StorageResult<()>;

    /// Load the snapshot for a session, if one exists.
    async fn load(&self, session_id: &str) -> StorageResult<Option<AgentSession>>;

    /// List ids of all persisted sessions.
    async fn list(&self) -> StorageResult<Vec<String>>;

    /// Delete a session's snapshot.
    ///
    /// Returns whether a snapshot existed.
    async fn delete(&self, session_id: &str) -> StorageResult<bool>;

    /// Remove snapshots last written before `cutoff`.
    ///
    /// Returns how many were removed. Unreadable entries are skipped,
    /// never fatal.
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}
