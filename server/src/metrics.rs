use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        metrics::describe_counter!(
            "reviews_submitted_total",
            "Total number of review requests accepted"
        );
        metrics::describe_counter!(
            "reviews_assigned_total",
            "Total number of reviewer assignments made"
        );
        metrics::describe_counter!(
            "reviews_scored_total",
            "Total number of reviews scored by a reviewer"
        );
        metrics::describe_counter!(
            "reviews_expired_total",
            "Total number of assignments that timed out"
        );
        metrics::describe_gauge!(
            "reviewer_sessions",
            "Number of live reviewer sessions"
        );

        Ok(Self { handle })
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}

pub fn record_review_submitted() {
    metrics::counter!("reviews_submitted_total", 1);
}

pub fn record_review_assigned() {
    metrics::counter!("reviews_assigned_total", 1);
}

pub fn record_review_scored(_passed: bool) {
    metrics::counter!("reviews_scored_total", 1);
}

pub fn record_reviews_expired(count: u64) {
    metrics::counter!("reviews_expired_total", count);
}

pub fn set_reviewer_sessions(count: i64) {
    metrics::gauge!("reviewer_sessions", count as f64);
}
