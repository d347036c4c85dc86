//! Public API wire types.

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::session::{AggregateStats, SessionStats};

/// Prefix for generated session ids.
pub const SESSION_ID_PREFIX: &str = "session_";

/// Body of `POST /api/v1/query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The research question.
    pub query: String,
    /// Existing session to continue; omit for a fresh session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Only streaming responses are supported; `false` is rejected.
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Body of `GET /api/v1/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionStats>,
    pub count: usize,
}

/// Body of `GET /api/v1/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatsResponse {
    #[serde(flatten)]
    pub sessions: AggregateStats,
    pub cache: CacheStatsSection,
}

/// Per-cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSection {
    pub search: CacheStats,
    pub fetch: CacheStats,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"query": "what is rust?"}"#).unwrap();
        assert_eq!(request.query, "what is rust?");
        assert!(request.session_id.is_none());
        assert!(request.stream, "stream defaults to true");
    }

    #[test]
    fn query_request_accepts_all_fields() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"query": "more", "session_id": "session_abc", "stream": false}"#,
        )
        .unwrap();
        assert_eq!(request.session_id.as_deref(), Some("session_abc"));
        assert!(!request.stream);
    }

    #[test]
    fn query_request_rejects_missing_query() {
        let result = serde_json::from_str::<QueryRequest>(r#"{"session_id": "session_abc"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn stats_response_flattens_session_totals() {
        let response = ServiceStatsResponse {
            sessions: AggregateStats {
                total_sessions: 2,
                total_tool_invocations: 7,
            },
            cache: CacheStatsSection {
                search: CacheStats::default(),
                fetch: CacheStats::default(),
            },
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["total_sessions"], 2);
        assert_eq!(value["total_tool_invocations"], 7);
        assert!(value["cache"]["search"].is_object());
        assert!(value["cache"]["fetch"].is_object());
    }
}
