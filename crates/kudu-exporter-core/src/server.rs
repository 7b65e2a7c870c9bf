//! Pull-style exposition: an axum server answering Prometheus scrapes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::render::{PrometheusRenderer, TEXT_CONTENT_TYPE};
use crate::store::MetricStore;
use crate::ticker::shutdown_requested;

const INDEX_HTML: &str = r#"<html>
<head><title>Kudu Exporter</title></head>
<body>
<h1>Kudu Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

#[derive(Clone)]
pub struct ReportState {
    store: MetricStore,
    renderer: Arc<PrometheusRenderer>,
}

impl ReportState {
    pub fn new(store: MetricStore, renderer: PrometheusRenderer) -> Self {
        Self {
            store,
            renderer: Arc::new(renderer),
        }
    }
}

pub fn router(state: ReportState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> &'static str {
    "ok"
}

/// One scrape is one snapshot; the handler never triggers a fetch.
async fn metrics(State(state): State<ReportState>) -> Response {
    let snapshot = state.store.snapshot();
    match state.renderer.render(&snapshot) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, nodes = snapshot.len(), "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub struct ReportServer {
    state: ReportState,
}

impl ReportServer {
    pub fn new(store: MetricStore, renderer: PrometheusRenderer) -> Self {
        Self {
            state: ReportState::new(store, renderer),
        }
    }

    /// Serve on `listener` until `shutdown` fires, then finish in-flight
    /// scrapes.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Serving metrics");
        }
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
            .await
    }
}
