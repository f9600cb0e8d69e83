//! Request accounting middleware
//!
//! Feeds every response into the health monitor and the HTTP request counter.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::AppState;
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// # Usage
/// ```ignore
/// let app = Router::new()
///     .route("/health", get(health))
///     .layer(middleware::from_fn_with_state(state.clone(), track_requests));
/// ```
pub async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    state
        .health
        .record_request(started.elapsed(), status.is_server_error());
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), status.as_str()])
        .inc();

    response
}
