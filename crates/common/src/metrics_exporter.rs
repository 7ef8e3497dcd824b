//! Prometheus scrape endpoint, compiled with the `profiling` feature.

use std::io;
use std::net::SocketAddr;

use axum::extract::State;
use axum::{routing::get, Router};
use tokio::net::TcpListener;

use crate::metrics::{global_metrics, MetricsRegistry};
use crate::shutdown::Shutdown;

/// Serve the process-wide registry at `GET /metrics` until `shutdown` fires.
pub async fn run_metrics_exporter(addr: SocketAddr, shutdown: Shutdown) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics exporter listening");
    serve_metrics(listener, global_metrics().clone(), shutdown).await
}

pub async fn serve_metrics(
    listener: TcpListener,
    registry: MetricsRegistry,
    shutdown: Shutdown,
) -> io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(io::Error::other)
}

async fn render(State(registry): State<MetricsRegistry>) -> String {
    registry.render_prometheus()
}
