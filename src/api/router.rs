//! HTTP router: intake, alerts, and agent meta endpoints.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::core_state::CoreState;

/// Build the application router.
///
/// NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
pub fn build_router(state: Arc<CoreState>) -> Router {
    Router::new()
        .route("/intake", post(endpoints::intake::upload))
        .route("/intake/simulate", get(endpoints::intake::simulate))
        .route("/intake/queue", get(endpoints::intake::queue))
        .route("/intake/:id/results", get(endpoints::intake::results))
        .route("/alerts", get(endpoints::alerts::unresolved))
        .route("/alerts/all", get(endpoints::alerts::all))
        .route("/alerts/resolve/:flag_id", post(endpoints::alerts::resolve))
        .route("/health", get(endpoints::meta::health))
        .route("/agent/process-now", post(endpoints::meta::process_now))
        .route("/agent/activity", get(endpoints::meta::activity))
        .with_state(state)
        // Axum's default body limit (2 MB) is below the upload cap.
        .layer(DefaultBodyLimit::max(21 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
