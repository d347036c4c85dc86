use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::cache::ResultCache;
use crate::handlers;
use crate::session::SessionRegistry;

// ============================================================================
// Runtime Services
// ============================================================================

/// Shared runtime services used by handlers and the maintenance sweep.
#[derive(Clone)]
pub struct RuntimeServices {
    pub registry: SessionRegistry,
    pub search_cache: Arc<ResultCache>,
    pub fetch_cache: Arc<ResultCache>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: RuntimeServices,
    pub keep_alive_interval_seconds: u64,
    pub max_concurrent_requests: usize,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    let max_concurrent_requests = state.max_concurrent_requests;

    // SSE streaming route - no request timeout (the engine idle timeout
    // governs long-lived streams)
    let streaming_routes = Router::new()
        .route("/query", post(handlers::v1::query))
        .with_state(state.clone());

    // Regular API routes - with request timeout
    let api_routes = Router::new()
        .route("/sessions", get(handlers::v1::list_sessions))
        .route(
            "/sessions/{session_id}",
            get(handlers::v1::get_session).delete(handlers::v1::delete_session),
        )
        .route("/stats", get(handlers::v1::service_stats))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ));

    let api_v1 = Router::new()
        .merge(streaming_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_v1)
}
