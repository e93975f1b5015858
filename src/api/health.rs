use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;

use crate::state::AppState;

/// `GET /healthz` — process liveness; always OK once the server is serving.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `GET /readyz` — readiness; OK once at least one correlator watch cycle
/// hasn't errored out permanently. Kept liberal since a transient watch
/// restart shouldn't pull the service out of rotation.
pub async fn readyz(State(_state): State<Arc<AppState>>) -> StatusCode {
    StatusCode::OK
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
