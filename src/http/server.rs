use crate::error::{Result, ScrapeError};
use crate::export::prometheus::PrometheusExporter;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusExporter,
    metrics_path: String,
}

pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(
        host: &str,
        port: u16,
        metrics_path: &str,
        prometheus: PrometheusExporter,
    ) -> Result<Self> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| ScrapeError::Config(format!("invalid listen address {host}:{port}: {e}")))?;

        Ok(Self {
            addr,
            state: AppState {
                prometheus,
                metrics_path: metrics_path.to_string(),
            },
        })
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let metrics_path = self.state.metrics_path.clone();
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ScrapeError::Http(format!("failed to bind {}: {e}", self.addr)))?;
        info!(addr = %self.addr, metrics_path = metrics_path, "Starting HTTP server");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| ScrapeError::Http(e.to_string()))?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(&state.metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler));

    if state.metrics_path != "/" {
        router = router.route("/", get(root_handler));
    }

    router.with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let metrics = state.prometheus.render_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics,
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    if state.prometheus.store().is_healthy() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy").into_response()
    }
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.prometheus.store().last_refresh_timestamp() > 0 {
        (StatusCode::OK, "Ready").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Not ready - no metadata refresh yet",
        )
            .into_response()
    }
}

/// Response body for the /status endpoint.
#[derive(Serialize)]
struct StatusResponse {
    up: bool,
    last_refresh_timestamp_seconds: u64,
    tracked_partitions: usize,
    tracked_groups: usize,
    series: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let store = state.prometheus.store();
    Json(StatusResponse {
        up: store.is_healthy(),
        last_refresh_timestamp_seconds: store.last_refresh_timestamp(),
        tracked_partitions: store.tracked_partitions(),
        tracked_groups: store.tracked_groups(),
        series: store.len(),
    })
}

async fn root_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Kafka Offset Exporter</title></head>
<body>
<h1>Kafka Offset Exporter</h1>
<p><a href="{}">Metrics</a></p>
<p><a href="/health">Health</a></p>
<p><a href="/ready">Ready</a></p>
<p><a href="/status">Status</a></p>
</body>
</html>"#,
        state.metrics_path
    ))
}
