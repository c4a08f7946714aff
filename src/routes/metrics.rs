use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the Prometheus recorder and describe the batch metrics.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_histogram!(
        "receipt_extraction_seconds",
        "Time spent in one extraction attempt"
    );
    metrics::describe_counter!(
        "receipt_jobs_ready_total",
        "Extraction attempts that produced a receipt"
    );
    metrics::describe_counter!(
        "receipt_jobs_failed_total",
        "Extraction attempts that failed or timed out"
    );
    metrics::describe_counter!(
        "receipt_credits_debited_total",
        "Credits debited for saved receipts"
    );
    metrics::describe_counter!(
        "receipt_commit_failures_total",
        "Review items that could not be saved"
    );

    Ok(Arc::new(handle))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
