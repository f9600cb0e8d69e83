//! Admin API endpoints
//!
//! Operator controls for the data layer.

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;

use crate::AppState;
use crate::data::{CacheStats, ConnectionStatus, SyncReport};
use crate::error::AppError;

/// Create admin router
///
/// Routes:
/// - GET /admin/cache - Cache statistics
/// - DELETE /admin/cache - Drop every cached read
/// - POST /admin/fallback/sync - Refresh all fallback snapshots from the live store
/// - GET /admin/connection - Live store connection status
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/cache", get(cache_stats).delete(clear_cache))
        .route("/fallback/sync", post(sync_fallback))
        .route("/connection", get(connection_status))
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_ratio: f64,
}

/// GET /admin/cache
async fn cache_stats(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    let stats = state.cache.stats();
    Json(CacheStatsResponse {
        hit_ratio: stats.hit_ratio(),
        stats,
    })
}

#[derive(Debug, Serialize)]
pub struct ClearCacheResponse {
    pub cleared: usize,
}

/// DELETE /admin/cache
async fn clear_cache(State(state): State<AppState>) -> Json<ClearCacheResponse> {
    let cleared = state.cache.len();
    state.cache.clear();
    tracing::info!(cleared, "Cache cleared by operator");
    Json(ClearCacheResponse { cleared })
}

// =============================================================================
// Fallback
// =============================================================================

/// POST /admin/fallback/sync
///
/// 503 when the live store is not connected; otherwise per-dataset results.
async fn sync_fallback(State(state): State<AppState>) -> Result<Json<SyncReport>, AppError> {
    if !state.connection.is_connected() {
        return Err(AppError::Unavailable(
            "live store is not connected".to_string(),
        ));
    }

    let report = state.data.sync_all().await;
    tracing::info!(
        synced = report.synced.len(),
        failed = report.failed.len(),
        "Fallback sync requested by operator"
    );
    Ok(Json(report))
}

// =============================================================================
// Connection
// =============================================================================

/// GET /admin/connection
async fn connection_status(State(state): State<AppState>) -> Json<ConnectionStatus> {
    Json(state.connection.status())
}
