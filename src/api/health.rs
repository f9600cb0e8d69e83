//! Health endpoints

use axum::{Router, extract::State, response::Json, routing::get};

use crate::AppState;
use crate::health::HealthReport;

/// Routes:
/// - GET /health - Liveness
/// - GET /health/report - Latest metrics and derived status
pub fn health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/report", get(health_report))
}

async fn health_check() -> &'static str {
    "OK"
}

/// Always 200; the derived status is in the body.
async fn health_report(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.report())
}
