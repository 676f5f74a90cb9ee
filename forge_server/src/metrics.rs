//! Prometheus metrics for pipeline observability.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("imageforge_builds_total", "status" => status.to_string()).increment(1);
}

/// Record image build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("imageforge_build_duration_ms").record(duration_ms as f64);
}

/// Record an agent report arrival.
pub fn agent_report(success: bool) {
    counter!("imageforge_agent_reports_total", "success" => success.to_string()).increment(1);
}

/// Record a completed promotion.
pub fn image_promoted() {
    counter!("imageforge_promotions_total").increment(1);
}

/// Record a failed promotion — the page-worthy case.
pub fn promotion_failed() {
    counter!("imageforge_promotion_failures_total").increment(1);
}
