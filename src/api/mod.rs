pub mod events;
pub mod health;
pub mod pulls;
pub mod report;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/report", axum::routing::post(report::submit_report))
        .route("/api/v1/pulls", get(pulls::list_pulls))
        .route("/api/v1/events", get(events::stream_events))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .with_state(state)
}
