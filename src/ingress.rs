use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

use crate::errors::IngressError;
use crate::model::Report;

/// Request body size cap for `POST /api/v1/report` (§4.5).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Minimum spacing enforced per reporting node.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(500);
/// Bound on the rate-limiter table, so an unbounded set of node names can't
/// grow it forever.
pub const MAX_RATE_LIMIT_ENTRIES: usize = 1024;
/// Node names longer than this are rejected outright.
pub const MAX_NODE_NAME_LEN: usize = 253;

/// Per-node last-accepted-report timestamps, guarded by its own lock,
/// independent of the aggregator's (§5).
#[derive(Clone)]
pub struct RateLimiter {
    last_seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit a report from `node` if the minimum window has elapsed since its
    /// last accepted report. Evicts the oldest entry when the table is full
    /// and `node` is not already tracked.
    pub async fn check(&self, node: &str) -> Result<(), IngressError> {
        let now = Instant::now();
        let mut table = self.last_seen.lock().await;

        if let Some(last) = table.get(node) {
            if now.saturating_duration_since(*last) < RATE_LIMIT_WINDOW {
                return Err(IngressError::RateLimited);
            }
        } else if table.len() >= MAX_RATE_LIMIT_ENTRIES {
            if let Some(oldest) = table
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone())
            {
                table.remove(&oldest);
            }
        }

        table.insert(node.to_string(), now);
        Ok(())
    }
}

/// Constant-time bearer token check against the configured agent token. A
/// `None` configured token disables authentication entirely (open ingest).
pub fn check_bearer_token(configured: Option<&str>, header: Option<&str>) -> Result<(), IngressError> {
    let Some(expected) = configured else {
        return Ok(());
    };
    let Some(header) = header else {
        return Err(IngressError::Unauthorized);
    };
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(IngressError::Unauthorized);
    };

    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(IngressError::Unauthorized)
    }
}

/// Full admission pipeline for one incoming report body: size cap, JSON
/// decode, node-name validation (§4.5). Rate limiting is checked separately
/// by the caller once the node name is known.
pub fn validate_report_body(body: &Bytes) -> Result<Report, IngressError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(IngressError::TooLarge);
    }

    let report: Report =
        serde_json::from_slice(body).map_err(|e| IngressError::Malformed(e.to_string()))?;

    if report.node_name.is_empty() || report.node_name.len() > MAX_NODE_NAME_LEN {
        return Err(IngressError::InvalidNode(report.node_name.clone()));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_check_passes_when_no_token_configured() {
        assert!(check_bearer_token(None, None).is_ok());
    }

    #[test]
    fn bearer_check_rejects_missing_header_when_required() {
        assert!(check_bearer_token(Some("secret"), None).is_err());
    }

    #[test]
    fn bearer_check_rejects_wrong_token() {
        assert!(check_bearer_token(Some("secret"), Some("Bearer nope")).is_err());
    }

    #[test]
    fn bearer_check_accepts_matching_token() {
        assert!(check_bearer_token(Some("secret"), Some("Bearer secret")).is_ok());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let body = Bytes::from(vec![b'a'; MAX_BODY_BYTES + 1]);
        assert!(matches!(
            validate_report_body(&body),
            Err(IngressError::TooLarge)
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let body = Bytes::from_static(b"not json");
        assert!(matches!(
            validate_report_body(&body),
            Err(IngressError::Malformed(_))
        ));
    }

    #[test]
    fn empty_node_name_is_rejected() {
        let body = Bytes::from(
            serde_json::json!({ "nodeName": "", "timestamp": chrono::Utc::now(), "pulls": [] })
                .to_string(),
        );
        assert!(matches!(
            validate_report_body(&body),
            Err(IngressError::InvalidNode(_))
        ));
    }

    #[test]
    fn valid_body_decodes() {
        let body = Bytes::from(
            serde_json::json!({ "nodeName": "n1", "timestamp": chrono::Utc::now(), "pulls": [] })
                .to_string(),
        );
        let report = validate_report_body(&body).unwrap();
        assert_eq!(report.node_name, "n1");
    }

    #[tokio::test]
    async fn rate_limiter_rejects_within_window() {
        let limiter = RateLimiter::new();
        limiter.check("n1").await.unwrap();
        assert!(matches!(
            limiter.check("n1").await,
            Err(IngressError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn rate_limiter_allows_different_nodes_independently() {
        let limiter = RateLimiter::new();
        limiter.check("n1").await.unwrap();
        assert!(limiter.check("n2").await.is_ok());
    }
}
