/// Prometheus metrics for the pipelines and the firehose producer
///
/// - events handled per pipeline and outcome
/// - handler latency
/// - poll results and atomic ack failures
/// - raw firehose messages

use crate::error::{PipelineError, PipelineResult};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // ========== Pipeline Metrics ==========

    /// Entries handled, by pipeline and outcome (kept, rejected, failed)
    pub static ref EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_events_total",
        "Total number of stream entries handled",
        &["pipeline", "outcome"]
    )
    .unwrap();

    /// Time spent inside each handler
    pub static ref HANDLER_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "pipeline_handler_duration_seconds",
        "Handler latencies in seconds",
        &["handler"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// Consumer group polls by result (entries, empty, error)
    pub static ref POLLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_polls_total",
        "Total number of consumer group reads",
        &["pipeline", "result"]
    )
    .unwrap();

    /// Failed ack + mark-seen attempts
    pub static ref ACK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "pipeline_ack_failures_total",
        "Total number of failed atomic acknowledge and mark-seen calls",
        &["pipeline"]
    )
    .unwrap();

    // ========== Firehose Metrics ==========

    /// Jetstream frames by result (appended, skipped, invalid, store_error)
    pub static ref FIREHOSE_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "firehose_messages_total",
        "Total number of Jetstream messages received",
        &["result"]
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text format
pub fn render_metrics() -> PipelineResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| PipelineError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| PipelineError::Internal(format!("Metrics are not valid UTF-8: {}", e)))
}

/// Record one firehose frame
pub fn record_firehose_message(result: &str) {
    FIREHOSE_MESSAGES_TOTAL.with_label_values(&[result]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_pipeline_metrics() {
        EVENTS_TOTAL.with_label_values(&["test", "kept"]).inc();
        record_firehose_message("appended");

        let text = render_metrics().unwrap();
        assert!(text.contains("pipeline_events_total"));
        assert!(text.contains("firehose_messages_total"));
    }
}
