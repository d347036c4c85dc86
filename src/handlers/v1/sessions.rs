//! Session inspection HTTP handlers.

use axum::Json;
use axum::extract::{Path as PathExtract, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::api::ListSessionsResponse;
use crate::handlers::problem_details;
use crate::server::AppState;

/// GET /api/v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let sessions = state.services.registry.list();
    let count = sessions.len();
    Json(ListSessionsResponse { sessions, count })
}

/// GET /api/v1/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<String>,
) -> Response {
    let Some(orchestrator) = state.services.registry.get(&session_id) else {
        return problem_details::not_found("session not found").into_response();
    };

    (StatusCode::OK, Json(orchestrator.stats())).into_response()
}

/// DELETE /api/v1/sessions/{session_id}
///
/// Removes the live session and its persisted snapshot. 404 when neither
/// exists.
pub async fn delete_session(
    State(state): State<AppState>,
    PathExtract(session_id): PathExtract<String>,
) -> Response {
    if state.services.registry.delete(&session_id).await {
        info!(session_id = %session_id, "session deleted");
        StatusCode::NO_CONTENT.into_response()
    } else {
        problem_details::not_found("session not found").into_response()
    }
}
