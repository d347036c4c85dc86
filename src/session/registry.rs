//! Session registry: lookup, creation, resume, and aggregate stats.
//!
//! The registry owns the map of live sessions and the shared services
//! every orchestrator needs. Snapshots are resumed lazily: a persisted
//! session only comes back to life when a client asks for it by id.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::api::SESSION_ID_PREFIX;
use crate::cache::ResultCache;
use crate::engine::QueryEngine;
use crate::retry::RetryPolicy;
use crate::session::orchestrator::{SessionLimits, SessionOrchestrator};
use crate::session::state::AgentSession;
use crate::session::SessionStats;
use crate::store::SessionStore;

/// Totals across live sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub total_sessions: usize,
    pub total_tool_invocations: u64,
}

// ============================================================================
// Session Registry
// ============================================================================

/// Creates, resumes, and indexes live sessions.
///
/// Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    /// Live orchestrators by session id.
    sessions: Arc<DashMap<String, Arc<SessionOrchestrator>>>,
    engine: Arc<dyn QueryEngine>,
    store: Arc<dyn SessionStore>,
    search_cache: Arc<ResultCache>,
    fetch_cache: Arc<ResultCache>,
    retry: RetryPolicy,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn SessionStore>,
        search_cache: Arc<ResultCache>,
        fetch_cache: Arc<ResultCache>,
        retry: RetryPolicy,
        limits: SessionLimits,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            engine,
            store,
            search_cache,
            fetch_cache,
            retry,
            limits,
        }
    }

    fn build(&self, session: AgentSession) -> Arc<SessionOrchestrator> {
        Arc::new(SessionOrchestrator::new(
            session,
            Arc::clone(&self.engine),
            Arc::clone(&self.store),
            Arc::clone(&self.search_cache),
            Arc::clone(&self.fetch_cache),
            self.retry.clone(),
            self.limits.clone(),
        ))
    }

    // ------------------------------------------------------------------------
    // Core API
    // ------------------------------------------------------------------------

    /// Fetch a live session, resume a persisted one, or create a fresh
    /// session.
    ///
    /// A caller-supplied id that matches nothing is never adopted; the
    /// caller gets a fresh session under a generated id instead.
    pub async fn get_or_create(&self, session_id: Option<&str>) -> Arc<SessionOrchestrator> {
        if let Some(id) = session_id {
            if let Some(existing) = self.sessions.get(id) {
                return Arc::clone(existing.value());
            }

            match self.store.load(id).await {
                Ok(Some(snapshot)) => {
                    info!(
                        session_id = %id,
                        messages = snapshot.messages.len(),
                        "Resumed session from snapshot"
                    );
                    // Entry API so two concurrent resumes share one
                    // orchestrator.
                    let entry = self
                        .sessions
                        .entry(id.to_string())
                        .or_insert_with(|| self.build(snapshot));
                    return Arc::clone(entry.value());
                }
                Ok(None) => {
                    debug!(session_id = %id, "Unknown session id, creating a fresh session");
                }
                Err(e) => {
                    warn!(
                        session_id = %id,
                        error = %e,
                        "Failed to load session snapshot, creating a fresh session"
                    );
                }
            }
        }

        self.create()
    }

    /// Create a fresh session under a generated id.
    pub fn create(&self) -> Arc<SessionOrchestrator> {
        let id = format!("{}{}", SESSION_ID_PREFIX, Ulid::new());
        let orchestrator = self.build(AgentSession::new(&id));
        self.sessions.insert(id.clone(), Arc::clone(&orchestrator));
        info!(session_id = %id, "Created session");
        orchestrator
    }

    /// A live session by id. Never touches the store.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionOrchestrator>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Remove a session and its snapshot.
    ///
    /// Returns true if either the live session or a snapshot existed.
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed_live = self.sessions.remove(session_id).is_some();
        let removed_snapshot = match self.store.delete(session_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to delete session snapshot");
                false
            }
        };

        if removed_live || removed_snapshot {
            info!(session_id = %session_id, "Deleted session");
        }
        removed_live || removed_snapshot
    }

    /// Stats for every live session, oldest first.
    pub fn list(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> = self
            .sessions
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        stats
    }

    /// Totals across live sessions.
    pub fn aggregate_stats(&self) -> AggregateStats {
        let mut total_tool_invocations = 0u64;
        for entry in self.sessions.iter() {
            let stats = entry.value().stats();
            total_tool_invocations +=
                u64::from(stats.web_searches_used) + u64::from(stats.web_fetches_used);
        }
        AggregateStats {
            total_sessions: self.sessions.len(),
            total_tool_invocations,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
