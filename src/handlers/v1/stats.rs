//! Service-wide statistics handler.

use axum::Json;
use axum::extract::State;

use crate::api::{CacheStatsSection, ServiceStatsResponse};
use crate::server::AppState;

/// GET /api/v1/stats
pub async fn service_stats(State(state): State<AppState>) -> Json<ServiceStatsResponse> {
    Json(ServiceStatsResponse {
        sessions: state.services.registry.aggregate_stats(),
        cache: CacheStatsSection {
            search: state.services.search_cache.stats(),
            fetch: state.services.fetch_cache.stats(),
        },
    })
}
