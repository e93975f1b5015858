use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::warn;

use crate::correlator::WorkloadCorrelator;
use crate::live::ViewerRegistry;
use crate::metrics::Metrics;
use crate::model::{
    is_content_digest, LayerInput, LayerStatus, PullEvent, PullInput, PullRecord, Report,
    MERGED_PULL_PLACEHOLDER, MERGED_SLOT_SUFFIX,
};
use crate::rate::RateEstimator;

/// Active pull records permitted before new slots are dropped (§5).
pub const MAX_ACTIVE_PULLS: usize = 10_000;
/// Default stall timeout — a record with no fresh report in this long is
/// force-completed by the housekeeper (§4.7).
pub const STALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);
/// Default history retention past `completedAt` (§4.7), overridable via config.
pub const DEFAULT_HISTORY_RETENTION: std::time::Duration = std::time::Duration::from_secs(30 * 60);

struct AggregatorState {
    records: HashMap<String, PullRecord>,
    /// Rate estimators keyed by slot (pull-level) or `slot:layer:<digest>`.
    rates: HashMap<String, RateEstimator>,
    last_seen: HashMap<String, Instant>,
    /// Clamp store for the monotonic feed, same keyspace as `rates`.
    last_bytes: HashMap<String, i64>,
}

/// Merges per-node snapshots into authoritative per-image pull records,
/// detects completions, and computes aggregate metrics (C4). Holds one
/// exclusive lock over all of its state; processing a report is O(pulls ×
/// layers) and performs no I/O while the lock is held.
pub struct Aggregator {
    state: RwLock<AggregatorState>,
    correlator: WorkloadCorrelator,
    viewers: ViewerRegistry,
    metrics: Metrics,
}

impl Aggregator {
    pub fn new(correlator: WorkloadCorrelator, viewers: ViewerRegistry, metrics: Metrics) -> Self {
        Self {
            state: RwLock::new(AggregatorState {
                records: HashMap::new(),
                rates: HashMap::new(),
                last_seen: HashMap::new(),
                last_bytes: HashMap::new(),
            }),
            correlator,
            viewers,
            metrics,
        }
    }

    /// Read-only snapshot for `GET /api/v1/pulls`.
    pub async fn list_pulls(&self) -> Vec<PullRecord> {
        let state = self.state.read().await;
        state.records.values().cloned().collect()
    }

    /// Initial snapshot sent to a newly-connected viewer, before incremental
    /// frames begin (C6).
    pub async fn snapshot_events(&self) -> Vec<PullEvent> {
        let state = self.state.read().await;
        state
            .records
            .values()
            .cloned()
            .map(PullEvent::progress)
            .collect()
    }

    /// Reconcile one validated report against server state (§4.4), then
    /// broadcast the resulting events to live viewers. The aggregator lock is
    /// released before any viewer I/O happens.
    pub async fn process_report(&self, report: Report) {
        let node = report.node_name.clone();
        let now = chrono::Utc::now();
        let merged_pulls = merge_digest_pulls(report.pulls);

        let mut progress_events = Vec::new();
        let mut completed_events = Vec::new();

        {
            let mut state = self.state.write().await;
            let mut updated_slots: HashSet<String> = HashSet::new();

            for pull in merged_pulls {
                let is_merged = pull.image_ref == MERGED_PULL_PLACEHOLDER;
                let slot = if is_merged {
                    format!("{node}:{MERGED_SLOT_SUFFIX}")
                } else {
                    format!("{node}:{}", pull.image_ref)
                };
                updated_slots.insert(slot.clone());

                let needs_fresh = match state.records.get(&slot) {
                    None => true,
                    Some(existing) => existing.is_completed(),
                };

                if needs_fresh {
                    if state.records.len() >= MAX_ACTIVE_PULLS {
                        warn!(slot = %slot, "active pull cap reached, dropping new record");
                        continue;
                    }
                    let id = format!(
                        "{slot}@{}",
                        now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp())
                    );
                    state.records.insert(
                        slot.clone(),
                        PullRecord {
                            id,
                            node: node.clone(),
                            image_ref: pull.image_ref.clone(),
                            started_at: pull.started_at,
                            completed_at: None,
                            total_bytes: 0,
                            downloaded_bytes: 0,
                            percent: 0.0,
                            bytes_per_sec: 0.0,
                            eta_seconds: None,
                            layer_count: 0,
                            layers_done: 0,
                            total_known: pull.total_known,
                            layers: Vec::new(),
                            pods: Vec::new(),
                        },
                    );
                    self.metrics.pulls_started.inc();
                    self.metrics.pulls_active.inc();
                }

                // Resolve a merged slot's human-readable name once it's known.
                if is_merged {
                    let still_unresolved = state
                        .records
                        .get(&slot)
                        .map(|r| r.image_ref == MERGED_PULL_PLACEHOLDER)
                        .unwrap_or(false);
                    if still_unresolved {
                        let mut resolved = self.correlator.pulling_images_for_node(&node).await;
                        if resolved.is_empty() {
                            resolved = self.correlator.waiting_images_for_node(&node).await;
                        }
                        if let Some(name) = resolved.into_iter().next() {
                            if let Some(record) = state.records.get_mut(&slot) {
                                record.image_ref = name;
                            }
                        }
                    }
                }

                state.last_seen.insert(slot.clone(), Instant::now());

                let (layers, total_bytes, downloaded_bytes, layers_done) =
                    reconcile_layers(&mut state.rates, &mut state.last_bytes, &slot, &pull.layers);

                let pull_rate_key = slot.clone();
                let prev_pull_bytes = state.last_bytes.get(&pull_rate_key).copied().unwrap_or(0);
                let clamped_downloaded = prev_pull_bytes.max(downloaded_bytes);
                state
                    .last_bytes
                    .insert(pull_rate_key.clone(), clamped_downloaded);
                let pull_estimator = state.rates.entry(pull_rate_key).or_default();
                pull_estimator.add(clamped_downloaded);
                let bytes_per_sec = pull_estimator.rate();

                let remaining = total_bytes - clamped_downloaded;
                let eta_seconds = if pull.total_known && remaining > 0 {
                    Some(pull_estimator.eta(remaining))
                } else {
                    None
                };

                let percent = if total_bytes > 0 {
                    ((clamped_downloaded as f64 / total_bytes as f64) * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                };

                let record = state
                    .records
                    .get_mut(&slot)
                    .expect("record was just inserted or already present");
                record.total_bytes = total_bytes;
                record.downloaded_bytes = clamped_downloaded;
                record.layer_count = layers.len();
                record.layers_done = layers_done;
                record.total_known = pull.total_known;
                record.bytes_per_sec = bytes_per_sec;
                record.eta_seconds = eta_seconds;
                record.percent = percent;
                record.layers = layers;

                let image_ref = record.image_ref.clone();
                drop(record);

                let pods = self.correlator.pods_for_image(&node, &image_ref).await;
                if let Some(record) = state.records.get_mut(&slot) {
                    record.pods = pods;
                    progress_events.push(PullEvent::progress(record.clone()));
                }
            }

            // Post-pass: implicit completion for every slot under this node
            // not touched by this report.
            let node_prefix = format!("{node}:");
            let stale_slots: Vec<String> = state
                .records
                .iter()
                .filter(|(slot, record)| {
                    slot.starts_with(&node_prefix)
                        && !updated_slots.contains(*slot)
                        && !record.is_completed()
                })
                .map(|(slot, _)| slot.clone())
                .collect();

            for slot in stale_slots {
                if let Some(record) = state.records.get_mut(&slot) {
                    record.completed_at = Some(now);
                    record.percent = 100.0;
                    self.metrics.pulls_active.dec();
                    self.metrics.pulls_completed.inc();
                    completed_events.push(PullEvent::completed(record.clone()));
                }
            }
        }

        for event in progress_events.into_iter().chain(completed_events) {
            self.viewers.broadcast(&event).await;
        }
    }

    /// Evict retained-past-TTL completed records and force-complete silent
    /// ones (C7). Returns counts for logging.
    pub async fn housekeep(
        &self,
        retention: std::time::Duration,
        stall_timeout: std::time::Duration,
    ) -> (usize, usize) {
        let now_instant = Instant::now();
        let now_wall = chrono::Utc::now();
        let mut state = self.state.write().await;

        let mut evicted = 0usize;
        let evict_slots: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| {
                r.completed_at
                    .map(|c| now_wall.signed_duration_since(c).to_std().unwrap_or_default() > retention)
                    .unwrap_or(false)
            })
            .map(|(slot, _)| slot.clone())
            .collect();

        for slot in evict_slots {
            state.records.remove(&slot);
            state.last_seen.remove(&slot);
            state.last_bytes.remove(&slot);
            state.rates.remove(&slot);
            let layer_prefix = format!("{slot}:layer:");
            state.rates.retain(|k, _| !k.starts_with(&layer_prefix));
            state.last_bytes.retain(|k, _| !k.starts_with(&layer_prefix));
            evicted += 1;
        }

        let mut force_completed = 0usize;
        let stalled_slots: Vec<String> = state
            .records
            .iter()
            .filter(|(slot, r)| {
                !r.is_completed()
                    && state
                        .last_seen
                        .get(*slot)
                        .map(|seen| now_instant.saturating_duration_since(*seen) > stall_timeout)
                        .unwrap_or(false)
            })
            .map(|(slot, _)| slot.clone())
            .collect();

        for slot in stalled_slots {
            if let Some(record) = state.records.get_mut(&slot) {
                record.completed_at = Some(now_wall);
                record.percent = 100.0;
                self.metrics.pulls_active.dec();
                warn!(slot = %slot, "pull force-completed after stall timeout");
                force_completed += 1;
            }
        }

        (evicted, force_completed)
    }
}

/// Pre-pass (§4.4): fuse raw content-digest entries in one report into a
/// single synthetic `__pulling__` pull. Identity on inputs with no digest
/// references.
pub fn merge_digest_pulls(pulls: Vec<PullInput>) -> Vec<PullInput> {
    let (digest_pulls, mut rest): (Vec<PullInput>, Vec<PullInput>) =
        pulls.into_iter().partition(|p| is_content_digest(&p.image_ref));

    if digest_pulls.is_empty() {
        return rest;
    }

    let started_at = digest_pulls
        .iter()
        .map(|p| p.started_at)
        .min()
        .unwrap_or_else(chrono::Utc::now);
    let total_known = digest_pulls.iter().all(|p| p.total_known);
    let layers: Vec<LayerInput> = digest_pulls.into_iter().flat_map(|p| p.layers).collect();

    rest.push(PullInput {
        image_ref: MERGED_PULL_PLACEHOLDER.to_string(),
        started_at,
        total_known,
        layers,
    });
    rest
}

fn reconcile_layers(
    rates: &mut HashMap<String, RateEstimator>,
    last_bytes: &mut HashMap<String, i64>,
    slot: &str,
    layers: &[LayerInput],
) -> (Vec<LayerStatus>, i64, i64, usize) {
    let mut out = Vec::with_capacity(layers.len());
    let mut total_bytes = 0i64;
    let mut downloaded_bytes = 0i64;
    let mut layers_done = 0usize;

    for layer in layers {
        let key = format!("{slot}:layer:{}", layer.digest);
        let prev = last_bytes.get(&key).copied().unwrap_or(0);
        let clamped = prev.max(layer.downloaded_bytes);
        last_bytes.insert(key.clone(), clamped);

        let estimator = rates.entry(key).or_default();
        estimator.add(clamped);
        let bytes_per_sec = estimator.rate();

        let percent = if layer.total_bytes > 0 {
            ((clamped as f64 / layer.total_bytes as f64) * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        if layer.total_known && clamped >= layer.total_bytes {
            layers_done += 1;
        }

        total_bytes += layer.total_bytes;
        downloaded_bytes += clamped;

        out.push(LayerStatus {
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
            total_bytes: layer.total_bytes,
            downloaded_bytes: clamped,
            total_known: layer.total_known,
            bytes_per_sec,
            percent,
        });
    }

    (out, total_bytes, downloaded_bytes, layers_done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LayerInput, PullInput, Report};

    fn layer(digest: &str, total: i64, downloaded: i64) -> LayerInput {
        LayerInput {
            digest: digest.into(),
            media_type: None,
            total_bytes: total,
            downloaded_bytes: downloaded,
            total_known: true,
        }
    }

    fn pull(image_ref: &str, layers: Vec<LayerInput>) -> PullInput {
        PullInput {
            image_ref: image_ref.into(),
            started_at: chrono::Utc::now(),
            total_known: true,
            layers,
        }
    }

    fn new_aggregator() -> Aggregator {
        Aggregator::new(
            WorkloadCorrelator::new(),
            ViewerRegistry::new(),
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn first_report_creates_a_record() {
        let agg = new_aggregator();
        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![pull("nginx:latest", vec![layer("sha256:a", 100, 50)])],
        })
        .await;

        let pulls = agg.list_pulls().await;
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].image_ref, "nginx:latest");
        assert_eq!(pulls[0].downloaded_bytes, 50);
        assert_eq!(pulls[0].total_bytes, 100);
        assert!(!pulls[0].is_completed());
    }

    #[tokio::test]
    async fn empty_follow_up_report_completes_prior_pull() {
        let agg = new_aggregator();
        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![pull("nginx:latest", vec![layer("sha256:a", 100, 100)])],
        })
        .await;

        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![],
        })
        .await;

        let pulls = agg.list_pulls().await;
        assert_eq!(pulls.len(), 1);
        assert!(pulls[0].is_completed());
        assert_eq!(pulls[0].percent, 100.0);
    }

    #[tokio::test]
    async fn all_digest_pulls_merge_into_one_record() {
        let agg = new_aggregator();
        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![
                pull("sha256:aaa", vec![layer("sha256:aaa", 10, 5)]),
                pull("sha256:bbb", vec![layer("sha256:bbb", 20, 10)]),
            ],
        })
        .await;

        let pulls = agg.list_pulls().await;
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].image_ref, "__pulling__");
        assert_eq!(pulls[0].layers.len(), 2);
        assert_eq!(pulls[0].node, "n1");
    }

    #[tokio::test]
    async fn restarted_pull_in_same_slot_gets_fresh_id() {
        let agg = new_aggregator();
        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![pull("nginx:latest", vec![layer("sha256:a", 100, 100)])],
        })
        .await;
        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![],
        })
        .await;
        let first_id = agg.list_pulls().await[0].id.clone();

        agg.process_report(Report {
            node_name: "n1".into(),
            timestamp: chrono::Utc::now(),
            pulls: vec![pull("nginx:latest", vec![layer("sha256:a", 50, 10)])],
        })
        .await;

        let pulls = agg.list_pulls().await;
        assert_eq!(pulls.len(), 1);
        assert_ne!(pulls[0].id, first_id);
        assert!(!pulls[0].is_completed());
    }

    #[test]
    fn merge_digest_pulls_is_identity_without_digests() {
        let pulls = vec![pull("nginx:latest", vec![])];
        let merged = merge_digest_pulls(pulls.clone());
        assert_eq!(merged.len(), pulls.len());
        assert_eq!(merged[0].image_ref, "nginx:latest");
    }

    #[test]
    fn merge_digest_pulls_mixed_input_yields_k_plus_one() {
        let pulls = vec![
            pull("nginx:latest", vec![]),
            pull("sha256:aaa", vec![layer("sha256:aaa", 1, 1)]),
        ];
        let merged = merge_digest_pulls(pulls);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|p| p.image_ref == "nginx:latest"));
        assert!(merged.iter().any(|p| p.image_ref == MERGED_PULL_PLACEHOLDER));
    }
}
