use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP bind address (env: HTTP_ADDR, default "0.0.0.0:8080"). Serves the
    /// report/pulls/events/health/metrics routes — there is no separate
    /// metrics listener in this implementation (see DESIGN.md).
    pub http_addr: String,

    /// Reserved for a future dedicated metrics listener (env: METRICS_ADDR,
    /// default "0.0.0.0:9090"). Currently unused: /metrics is served on
    /// `http_addr`.
    pub metrics_addr: String,

    /// Tracing verbosity floor used when `RUST_LOG` is unset (env: LOG_LEVEL,
    /// default "info"). One of debug|info|warn|error.
    pub log_level: String,

    /// Namespaces the workload correlator's pod watch is restricted to (env:
    /// WATCH_NAMESPACES, comma-separated; empty = all namespaces).
    pub watch_namespaces: Vec<String>,

    /// How long a completed pull record is retained before the housekeeper
    /// evicts it (env: HISTORY_TTL, default 30m).
    pub history_ttl: std::time::Duration,

    /// Bearer token required of report submitters, if set (env: AGENT_TOKEN).
    pub agent_token: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let history_ttl = match std::env::var("HISTORY_TTL") {
            Ok(raw) => humantime::parse_duration(&raw)
                .with_context(|| format!("invalid HISTORY_TTL {raw:?}"))?,
            Err(_) => std::time::Duration::from_secs(30 * 60),
        };

        let watch_namespaces = std::env::var("WATCH_NAMESPACES")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            http_addr: std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            metrics_addr: std::env::var("METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            watch_namespaces,
            history_ttl,
            agent_token: std::env::var("AGENT_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Whether the pod watch should be restricted to specific namespaces.
    pub fn has_namespace_filter(&self) -> bool {
        !self.watch_namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            http_addr: "0.0.0.0:8080".into(),
            metrics_addr: "0.0.0.0:9090".into(),
            log_level: "info".into(),
            watch_namespaces: vec![],
            history_ttl: std::time::Duration::from_secs(30 * 60),
            agent_token: None,
        }
    }

    #[test]
    fn has_namespace_filter_empty_is_false() {
        let cfg = base_config();
        assert!(!cfg.has_namespace_filter());
    }

    #[test]
    fn has_namespace_filter_true_when_set() {
        let cfg = AppConfig {
            watch_namespaces: vec!["kube-system".into()],
            ..base_config()
        };
        assert!(cfg.has_namespace_filter());
    }

    #[test]
    fn default_history_ttl_is_30_minutes() {
        let cfg = base_config();
        assert_eq!(cfg.history_ttl, std::time::Duration::from_secs(1800));
    }

    #[test]
    fn agent_token_empty_string_treated_as_unset() {
        let cfg = AppConfig {
            agent_token: Some(String::new()),
            ..base_config()
        };
        // from_env() filters empty strings; direct construction can still
        // hold one, so this documents intended usage rather than enforcing it.
        assert_eq!(cfg.agent_token, Some(String::new()));
    }
}
