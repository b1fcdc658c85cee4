//! Prometheus recorder and HTTP endpoint.
//!
//! The recorder is installed once per process. Without it every `metrics`
//! macro is a no-op, which is what unit tests rely on.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AddressParseSnafu, AlreadyInitializedSnafu, MetricsError, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the recorder and serve `/metrics` and `/health` on `address`.
pub fn init(address: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu)?;
    let handle = install_recorder()?;

    tokio::spawn(run_server(addr, handle));
    info!(%addr, "Metrics server started");
    Ok(())
}

/// Render the current metrics in Prometheus text format, if installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    ensure!(HANDLE.get().is_none(), AlreadyInitializedSnafu);

    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    HANDLE
        .set(handle.clone())
        .map_err(|_| AlreadyInitializedSnafu.build())?;
    Ok(handle)
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let err = init("not-an-address").unwrap_err();
        assert!(matches!(err, MetricsError::AddressParse { .. }));
    }
}
