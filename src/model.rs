use serde::{Deserialize, Serialize};

/// One node's complete snapshot of its active pulls, as submitted by the probe.
#[derive(Debug, Clone, Deserialize)]
pub struct Report {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub pulls: Vec<PullInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullInput {
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "totalKnown", default)]
    pub total_known: bool,
    #[serde(default)]
    pub layers: Vec<LayerInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerInput {
    pub digest: String,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(rename = "totalBytes", default)]
    pub total_bytes: i64,
    #[serde(rename = "downloadedBytes", default)]
    pub downloaded_bytes: i64,
    #[serde(rename = "totalKnown", default)]
    pub total_known: bool,
}

/// A content-digest reference tracked by the runtime before it resolves to an
/// image name. See §4.4 of the aggregation design: all prefixes below are
/// merged into one synthetic `__pulling__` pull per report.
pub const DIGEST_PREFIXES: &[&str] = &[
    "sha256:",
    "layer-sha256:",
    "config-sha256:",
    "manifest-sha256:",
    "index-sha256:",
];

pub fn is_content_digest(image_ref: &str) -> bool {
    DIGEST_PREFIXES
        .iter()
        .any(|prefix| image_ref.starts_with(prefix))
}

/// Image ref used for the synthetic merged record before it is resolved to a
/// human-readable name.
pub const MERGED_PULL_PLACEHOLDER: &str = "__pulling__";
/// Slot suffix for the synthetic merged record.
pub const MERGED_SLOT_SUFFIX: &str = "__merged__";

/// Authoritative server-side state for one (node, image) slot.
#[derive(Debug, Clone, Serialize)]
pub struct PullRecord {
    /// Fresh per pull instance — distinguishes a restarted pull in the same
    /// slot from its predecessor.
    pub id: String,
    #[serde(rename = "nodeName")]
    pub node: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "totalBytes")]
    pub total_bytes: i64,
    #[serde(rename = "downloadedBytes")]
    pub downloaded_bytes: i64,
    pub percent: f64,
    #[serde(rename = "bytesPerSec")]
    pub bytes_per_sec: f64,
    #[serde(rename = "etaSeconds", skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(rename = "layerCount")]
    pub layer_count: usize,
    #[serde(rename = "layersDone")]
    pub layers_done: usize,
    #[serde(rename = "totalKnown")]
    pub total_known: bool,
    pub layers: Vec<LayerStatus>,
    pub pods: Vec<PodCorrelation>,
}

impl PullRecord {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerStatus {
    pub digest: String,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(rename = "totalBytes")]
    pub total_bytes: i64,
    #[serde(rename = "downloadedBytes")]
    pub downloaded_bytes: i64,
    #[serde(rename = "totalKnown")]
    pub total_known: bool,
    #[serde(rename = "bytesPerSec")]
    pub bytes_per_sec: f64,
    pub percent: f64,
}

/// A pod/container currently blocked waiting for a pull on this node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PodCorrelation {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PullEventType {
    #[serde(rename = "pull.progress")]
    Progress,
    #[serde(rename = "pull.completed")]
    Completed,
}

/// Wire event emitted by the live-view multiplexer (C6), one per `data:` frame.
#[derive(Debug, Clone, Serialize)]
pub struct PullEvent {
    #[serde(rename = "schemaVersion")]
    pub schema_version: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub event_type: PullEventType,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    pub pull: PullRecord,
}

impl PullEvent {
    pub fn progress(record: PullRecord) -> Self {
        Self {
            schema_version: "v1",
            timestamp: chrono::Utc::now(),
            event_type: PullEventType::Progress,
            node_name: record.node.clone(),
            pull: record,
        }
    }

    pub fn completed(record: PullRecord) -> Self {
        Self {
            schema_version: "v1",
            timestamp: chrono::Utc::now(),
            event_type: PullEventType::Completed,
            node_name: record.node.clone(),
            pull: record,
        }
    }

    /// Render as one SSE `data:` frame (one or more `data:` lines, terminated
    /// by a blank line).
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_content_digest_matches_known_prefixes() {
        assert!(is_content_digest("sha256:aaa"));
        assert!(is_content_digest("layer-sha256:bbb"));
        assert!(is_content_digest("config-sha256:ccc"));
        assert!(is_content_digest("manifest-sha256:ddd"));
        assert!(is_content_digest("index-sha256:eee"));
        assert!(!is_content_digest("nginx:latest"));
    }

    #[test]
    fn sse_frame_has_data_prefix_and_blank_line_terminator() {
        let record = PullRecord {
            id: "r1".into(),
            node: "n1".into(),
            image_ref: "nginx:latest".into(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            total_bytes: 100,
            downloaded_bytes: 50,
            percent: 50.0,
            bytes_per_sec: 10.0,
            eta_seconds: Some(5.0),
            layer_count: 1,
            layers_done: 0,
            total_known: true,
            layers: vec![],
            pods: vec![],
        };
        let frame = PullEvent::progress(record).to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
    }
}
