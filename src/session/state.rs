//! Per-session owned state: transcript, tool counters, query lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ToolKind;

// ============================================================================
// Transcript
// ============================================================================

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Query Lifecycle
// ============================================================================

/// Lifecycle of the query currently owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryPhase {
    /// No query in flight.
    #[default]
    Idle,
    /// Accepted, engine not yet streaming.
    Dispatched,
    /// Engine output flowing.
    Streaming,
    /// The last query finished normally.
    Completed,
    /// The last query ended with an error.
    Failed,
}

// ============================================================================
// AgentSession
// ============================================================================

/// Owned state of one research session.
///
/// Serialized as-is for snapshots; the transient query phase is skipped
/// and resets to `Idle` on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub web_searches_used: u32,
    #[serde(default)]
    pub web_fetches_used: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip)]
    pub phase: QueryPhase,
}

impl AgentSession {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            web_searches_used: 0,
            web_fetches_used: 0,
            messages: Vec::new(),
            phase: QueryPhase::Idle,
        }
    }

    /// Whether another web search fits the quota.
    #[must_use]
    pub fn can_search(&self, max_searches: u32) -> bool {
        self.web_searches_used < max_searches
    }

    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    /// Count one use of `tool`.
    pub fn record_tool_use(&mut self, tool: ToolKind) {
        match tool {
            ToolKind::WebSearch => self.web_searches_used += 1,
            ToolKind::WebFetch => self.web_fetches_used += 1,
        }
    }

    /// Point-in-time stats; `max_searches` comes from the quota config.
    #[must_use]
    pub fn stats(&self, max_searches: u32) -> SessionStats {
        let now = Utc::now();
        SessionStats {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            web_searches_used: self.web_searches_used,
            web_fetches_used: self.web_fetches_used,
            max_searches,
            duration_seconds: (now - self.started_at).num_milliseconds() as f64 / 1000.0,
            message_count: self.messages.len(),
        }
    }
}

// ============================================================================
// SessionStats
// ============================================================================

/// Session statistics as serialized to clients, both in `complete`
/// stream events and on the sessions endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub web_searches_used: u32,
    pub web_fetches_used: u32,
    pub max_searches: u32,
    /// Age of the session in seconds.
    pub duration_seconds: f64,
    pub message_count: usize,
}

// ============================================================================
// Tests
// ============================================================================
