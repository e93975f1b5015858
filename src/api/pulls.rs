use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::model::PullRecord;
use crate::state::AppState;

/// `GET /api/v1/pulls` — current snapshot of every tracked pull record.
pub async fn list_pulls(State(state): State<Arc<AppState>>) -> Json<Vec<PullRecord>> {
    Json(state.aggregator.list_pulls().await)
}
