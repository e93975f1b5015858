use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::errors::IngressError;
use crate::ingress::{check_bearer_token, validate_report_body};
use crate::state::AppState;

/// `POST /api/v1/report` — accepts one node's pull snapshot (§4.5). Pipeline:
/// bearer auth, size cap, JSON decode, node-name validation, per-node rate
/// limit, then hand off to the aggregator.
pub async fn submit_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, IngressError> {
    check_bearer_token(
        state.config.agent_token.as_deref(),
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )?;

    let report = validate_report_body(&body)?;

    state.rate_limiter.check(&report.node_name).await?;

    state
        .metrics
        .reports_accepted
        .with_label_values(&[&report.node_name])
        .inc();
    state.aggregator.process_report(report).await;

    Ok(StatusCode::ACCEPTED)
}
