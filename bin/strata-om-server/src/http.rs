//! Metrics and health endpoints

use anyhow::Result;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use strata_om::{OzoneManager, PrometheusSink};
use tokio::net::TcpListener;
use tracing::info;

pub struct MetricsState {
    om: Arc<OzoneManager>,
    sink: PrometheusSink,
}

impl MetricsState {
    pub fn new(om: Arc<OzoneManager>) -> Self {
        let sink = PrometheusSink::new(&om.config().metrics.excluded_tags);
        Self { om, sink }
    }

    /// Push a fresh snapshot into the sink and render it
    pub fn render(&self) -> String {
        for record in self.om.metrics_records() {
            self.sink.put_metrics(&record);
        }
        self.sink.export()
    }
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.render(),
    )
}

async fn health_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    match state.om.flush_failed_at() {
        None => (StatusCode::OK, "OK".to_string()),
        Some(index) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("UNHEALTHY: flush failed at log index {index}"),
        ),
    }
}

pub async fn serve(
    listen: SocketAddr,
    state: Arc<MetricsState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    info!("Starting metrics server on {}", listen);
    let listener = TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{OmConfig, UserInfo};
    use strata_meta_store::MemoryStore;
    use strata_om::{CreateVolumeRequest, OmRequest};

    #[test]
    fn test_render_uses_node_tags() {
        let mut config = OmConfig::default();
        config.node.name = "om-a".to_string();
        let om = Arc::new(OzoneManager::with_store(config, Arc::new(MemoryStore::new())).unwrap());
        om.apply(
            1,
            &OmRequest::CreateVolume(CreateVolumeRequest::new("vol1", "alice")),
            &UserInfo::new("alice"),
        );

        let state = MetricsState::new(Arc::clone(&om));
        let output = state.render();
        assert!(output.contains("om_metrics_num_volume_creates{context=\"om\",hostname=\"om-a\"} 1\n"));
        assert!(output.contains("om_metrics_num_volumes{context=\"om\",hostname=\"om-a\"} 1\n"));
    }
}
