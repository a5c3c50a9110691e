// prometheus exporter setup

use metrics::counter;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const WEBHOOK_ALERTS_DROPPED_TOTAL: &str = "webhook_alerts_dropped_total";

pub fn report_dropped_alerts(cause: &'static str, quantity: u64) {
    counter!(WEBHOOK_ALERTS_DROPPED_TOTAL, "cause" => cause).increment(quantity);
}

pub fn report_webhook_outcome(format: &'static str, status: &'static str) {
    counter!("webhook_requests_by_outcome_total", "format" => format, "status" => status)
        .increment(1);
}

pub fn report_internal_error_metrics(err_type: &'static str, stage_tag: &'static str) {
    let tags = [("error", err_type), ("stage", stage_tag)];
    counter!("webhook_error_by_stage_and_type", &tags).increment(1);
}

pub fn setup_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];
    const BATCH_SIZES: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 750.0, 1000.0,
    ];
    const PAYLOAD_SIZES: &[f64] = &[
        1024.0,     // 1KB
        10240.0,    // 10KB
        102400.0,   // 100KB
        1048576.0,  // 1MB
        5242880.0,  // 5MB
        10485760.0, // 10MB, default body ceiling
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_string()), BATCH_SIZES)?
        .set_buckets_for_metric(
            Matcher::Full("webhook_body_size_bytes".to_string()),
            PAYLOAD_SIZES,
        )?
        .install_recorder()?;
    Ok(handle)
}
