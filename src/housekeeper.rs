use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::aggregator::{Aggregator, STALL_TIMEOUT};

/// How often the housekeeper sweeps for retention eviction and stalled pulls.
pub const HOUSEKEEPER_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically evicts completed records past their retention window and
/// force-completes pulls that have gone silent (C7). Runs as a single
/// long-lived background task; each tick takes the aggregator's write lock
/// once.
pub async fn run(aggregator: Arc<Aggregator>, history_ttl: Duration) {
    let mut interval = tokio::time::interval(HOUSEKEEPER_INTERVAL);
    interval.tick().await; // first tick fires immediately, skip it

    loop {
        interval.tick().await;
        let (evicted, force_completed) = aggregator.housekeep(history_ttl, STALL_TIMEOUT).await;
        if evicted > 0 || force_completed > 0 {
            debug!(evicted, force_completed, "housekeeping sweep complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::WorkloadCorrelator;
    use crate::live::ViewerRegistry;
    use crate::metrics::Metrics;
    use crate::model::{PullInput, Report};

    fn pull(image_ref: &str) -> PullInput {
        PullInput {
            image_ref: image_ref.into(),
            started_at: chrono::Utc::now(),
            total_known: true,
            layers: vec![],
        }
    }

    #[tokio::test]
    async fn housekeep_evicts_old_completed_records() {
        let aggregator = Aggregator::new(
            WorkloadCorrelator::new(),
            ViewerRegistry::new(),
            Metrics::new(),
        );
        aggregator
            .process_report(Report {
                node_name: "n1".into(),
                timestamp: chrono::Utc::now(),
                pulls: vec![pull("nginx:latest")],
            })
            .await;
        // Completing it: resend an empty report for the node.
        aggregator
            .process_report(Report {
                node_name: "n1".into(),
                timestamp: chrono::Utc::now(),
                pulls: vec![],
            })
            .await;
        assert_eq!(aggregator.list_pulls().await.len(), 1);

        let (evicted, _) = aggregator
            .housekeep(Duration::from_secs(0), Duration::from_secs(3600))
            .await;
        assert_eq!(evicted, 1);
        assert!(aggregator.list_pulls().await.is_empty());
    }

    #[tokio::test]
    async fn housekeep_retains_recent_completed_records() {
        let aggregator = Aggregator::new(
            WorkloadCorrelator::new(),
            ViewerRegistry::new(),
            Metrics::new(),
        );
        aggregator
            .process_report(Report {
                node_name: "n1".into(),
                timestamp: chrono::Utc::now(),
                pulls: vec![pull("nginx:latest")],
            })
            .await;
        aggregator
            .process_report(Report {
                node_name: "n1".into(),
                timestamp: chrono::Utc::now(),
                pulls: vec![],
            })
            .await;

        let (evicted, _) = aggregator
            .housekeep(Duration::from_secs(3600), Duration::from_secs(3600))
            .await;
        assert_eq!(evicted, 0);
        assert_eq!(aggregator.list_pulls().await.len(), 1);
    }
}
