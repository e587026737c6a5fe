use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        // Initialize metrics
        metrics::describe_counter!(
            "ws_connections_total",
            "Total number of WebSocket connections accepted"
        );
        metrics::describe_counter!(
            "chat_messages_processed_total",
            "Chat messages that completed the pipeline"
        );
        metrics::describe_counter!(
            "chat_messages_failed_total",
            "Chat messages that were rolled back or exhausted persistence retries"
        );
        metrics::describe_counter!(
            "chat_message_retries_total",
            "Cache and persistence retry attempts"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}
