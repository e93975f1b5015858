mod aggregator;
mod api;
mod config;
mod correlator;
mod errors;
mod housekeeper;
mod ingress;
mod live;
mod metrics;
mod model;
mod normalize;
mod rate;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use kube::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::aggregator::Aggregator;
use crate::config::AppConfig;
use crate::correlator::WorkloadCorrelator;
use crate::ingress::RateLimiter;
use crate::live::ViewerRegistry;
use crate::metrics::Metrics;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(http_addr = %config.http_addr, "starting pullwatch");

    let client = Client::try_default()
        .await
        .context("building in-cluster Kubernetes client")?;

    let correlator = WorkloadCorrelator::new();
    correlator.spawn(client, config.watch_namespaces.clone());

    let metrics = Metrics::new();
    let viewers = ViewerRegistry::new();
    let aggregator = Arc::new(Aggregator::new(correlator.clone(), viewers.clone(), metrics.clone()));

    tokio::spawn(housekeeper::run(aggregator.clone(), config.history_ttl));

    let state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        aggregator,
        correlator,
        viewers,
        rate_limiter: RateLimiter::new(),
        metrics,
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;

    info!(addr = %config.http_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    api::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining connections");
}
