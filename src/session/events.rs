//! Client-facing stream events.
//!
//! Every frame a query emits is one of these variants, serialized with a
//! `type` tag so clients can dispatch without peeking at other fields.

use serde::{Deserialize, Serialize};

use crate::engine::ToolKind;
use crate::session::state::SessionStats;

/// Status carried by the `session` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Started,
}

/// One frame of the client event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First frame of every accepted query.
    Session {
        session_id: String,
        status: QueryStatus,
    },
    /// Incremental assistant text.
    Text { content: String },
    /// A tool was invoked on the session's behalf.
    Tool { tool: ToolKind },
    /// Terminal frame of a successful query.
    Complete { session_stats: SessionStats },
    /// Terminal frame of a failed query.
    Error { error: String, session_id: String },
}

impl StreamEvent {
    #[must_use]
    pub fn session_started(session_id: impl Into<String>) -> Self {
        Self::Session {
            session_id: session_id.into(),
            status: QueryStatus::Started,
        }
    }

    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn tool(tool: ToolKind) -> Self {
        Self::Tool { tool }
    }

    #[must_use]
    pub fn complete(session_stats: SessionStats) -> Self {
        Self::Complete { session_stats }
    }

    #[must_use]
    pub fn error(error: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            session_id: session_id.into(),
        }
    }
}
