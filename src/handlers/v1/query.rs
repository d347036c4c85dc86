//! Query dispatch and SSE streaming handler.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{error, warn};

use crate::api::QueryRequest;
use crate::handlers::problem_details;
use crate::server::AppState;
use crate::session::QueryError;

/// POST /api/v1/query
///
/// Dispatches a research query on a new or resumed session and streams the
/// result as SSE. Every SSE data frame is a JSON object tagged by `type`:
///
/// - `session`: session id and dispatch status, always first
/// - `text`: answer fragment
/// - `tool`: a tool the engine invoked (first use per query)
/// - `complete`: closing session statistics, always last on success
/// - `error`: terminal failure, the stream ends after this
///
/// Rejections before the stream starts are problem+json: 400 for an invalid
/// body or query, 429 when the session's search quota is exhausted.
pub async fn query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    if !req.stream {
        return problem_details::bad_request("non-streaming responses are not supported")
            .into_response();
    }

    let orchestrator = state
        .services
        .registry
        .get_or_create(req.session_id.as_deref())
        .await;

    let events = match orchestrator.run_query(req.query).await {
        Ok(events) => events,
        Err(e @ QueryError::Validation(_)) => {
            return problem_details::bad_request(e.to_string()).into_response();
        }
        Err(e @ QueryError::QuotaExceeded { .. }) => {
            warn!(error = %e, "query rejected");
            return problem_details::too_many_requests(e.to_string()).into_response();
        }
        Err(e) => {
            error!(error = %e, "query dispatch failed");
            return problem_details::internal_error("query dispatch failed").into_response();
        }
    };

    let sse_stream = events.map(|event| Event::default().json_data(&event));

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(state.keep_alive_interval_seconds))
        .text("keep-alive");

    Sse::new(sse_stream).keep_alive(keep_alive).into_response()
}
