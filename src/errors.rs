use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

/// Errors that can reject a report before it reaches the aggregator (C5).
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("body exceeds the size cap")]
    TooLarge,
    #[error("malformed report body: {0}")]
    Malformed(String),
    #[error("invalid node name: {0}")]
    InvalidNode(String),
    #[error("rate limited")]
    RateLimited,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngressError::Unauthorized => StatusCode::UNAUTHORIZED,
            IngressError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            IngressError::Malformed(_) | IngressError::InvalidNode(_) => StatusCode::BAD_REQUEST,
            IngressError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        };
        warn!(error = %self, status = %status, "report rejected");
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Errors surfaced by the live-view multiplexer at connection admission (C6).
#[derive(Debug, thiserror::Error)]
pub enum LiveViewError {
    #[error("too many concurrent viewers")]
    AtCapacity,
}

impl IntoResponse for LiveViewError {
    fn into_response(self) -> Response {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Errors from the workload correlator's upstream watch loops (C3).
#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("watch stream error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),
}
