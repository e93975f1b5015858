use prometheus::{Counter, Encoder, Gauge, HistogramVec, IntCounterVec, Registry, TextEncoder};

/// Prometheus registry and handles for every series this service exports
/// (C11). Exposed over `GET /metrics` in text format, served on the same
/// listener as the rest of the API (see DESIGN.md for why there is no
/// separate metrics port).
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub pulls_active: Gauge,
    pub pulls_started: Counter,
    pub pulls_completed: Counter,
    pub pull_duration_seconds: HistogramVec,
    pub reports_accepted: IntCounterVec,
    pub reports_rejected: IntCounterVec,
    pub sse_clients: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let pulls_active = Gauge::new(
            "pullwatch_pulls_active",
            "Number of pull records currently in progress",
        )
        .expect("metric construction");
        let pulls_started = Counter::new(
            "pullwatch_pulls_started_total",
            "Pull records created since startup",
        )
        .expect("metric construction");
        let pulls_completed = Counter::new(
            "pullwatch_pulls_completed_total",
            "Pull records completed since startup",
        )
        .expect("metric construction");
        let pull_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "pullwatch_pull_duration_seconds",
                "Wall-clock duration of completed pulls",
            ),
            &["node"],
        )
        .expect("metric construction");
        let reports_accepted = IntCounterVec::new(
            prometheus::Opts::new(
                "pullwatch_reports_accepted_total",
                "Probe reports accepted, by node",
            ),
            &["node"],
        )
        .expect("metric construction");
        let reports_rejected = IntCounterVec::new(
            prometheus::Opts::new(
                "pullwatch_reports_rejected_total",
                "Probe reports rejected, by reason",
            ),
            &["reason"],
        )
        .expect("metric construction");
        let sse_clients = Gauge::new(
            "pullwatch_sse_clients",
            "Currently connected live-view subscribers",
        )
        .expect("metric construction");

        for collector in [
            Box::new(pulls_active.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(pulls_started.clone()),
            Box::new(pulls_completed.clone()),
            Box::new(pull_duration_seconds.clone()),
            Box::new(reports_accepted.clone()),
            Box::new(reports_rejected.clone()),
            Box::new(sse_clients.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            pulls_active,
            pulls_started,
            pulls_completed,
            pull_duration_seconds,
            reports_accepted,
            reports_rejected,
            sse_clients,
        }
    }

    /// Render the current registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .expect("text encoding never fails for well-formed metrics");
        String::from_utf8(buf).expect("prometheus text output is always valid utf-8")
    }
}
