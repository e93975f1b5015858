use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::config::AppConfig;
use crate::correlator::WorkloadCorrelator;
use crate::ingress::RateLimiter;
use crate::live::ViewerRegistry;
use crate::metrics::Metrics;

/// Shared application state handed to every axum handler, mirroring the
/// component split in SPEC_FULL.md §2: each field is independently lockable
/// and cheap to clone (Arc-wrapped internally).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub aggregator: Arc<Aggregator>,
    pub correlator: WorkloadCorrelator,
    pub viewers: ViewerRegistry,
    pub rate_limiter: RateLimiter,
    pub metrics: Metrics,
}
