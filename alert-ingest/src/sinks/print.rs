use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::alert::Alert;
use crate::context::RequestContext;
use crate::sinks::{AlertSink, SinkError};

/// Logs every alert instead of forwarding it, for local runs.
pub struct PrintSink {}

#[async_trait]
impl AlertSink for PrintSink {
    async fn process(&self, ctx: &RequestContext, alert: &Alert) -> Result<(), SinkError> {
        info!(
            request_id = %ctx.request_id,
            fingerprint = alert.fingerprint,
            alertname = alert.name(),
            status = %alert.status,
            "alert: {alert:?}"
        );
        counter!("alert_ingest_alerts_sunk_total", "sink" => "print").increment(1);

        Ok(())
    }
}
