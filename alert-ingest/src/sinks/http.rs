use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{header, Client, StatusCode};
use tracing::warn;

use crate::alert::Alert;
use crate::context::RequestContext;
use crate::middleware::request_id::REQUEST_ID_HEADER;
use crate::sinks::{AlertSink, SinkError};

const METRIC_SINK_REQUESTS: &str = "alert_ingest_pipeline_requests_total";

pub fn build_http_client(request_timeout: Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Client::builder()
        .default_headers(headers)
        .user_agent("alert-ingest")
        .timeout(request_timeout)
        .build()
}

/// Forwards each alert as JSON to the processing pipeline.
///
/// Connection failures and 5xx answers mean the pipeline is unavailable. A 404
/// means the pipeline holds no dedup state for the fingerprint, so the alert
/// is accepted as new. A 409 for conflicting dedup state, like any other
/// non-success answer, rejects the alert. Nothing is retried here.
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String, request_timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            url,
        })
    }
}

#[async_trait]
impl AlertSink for HttpSink {
    async fn process(&self, ctx: &RequestContext, alert: &Alert) -> Result<(), SinkError> {
        let request = self
            .client
            .post(&self.url)
            .header(REQUEST_ID_HEADER, ctx.request_id.as_str())
            .json(alert)
            .send();

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                counter!(METRIC_SINK_REQUESTS, "result" => "cancelled").increment(1);
                return Err(SinkError::Unavailable("request deadline exceeded".to_string()));
            }
            response = request => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                counter!(METRIC_SINK_REQUESTS, "result" => "error").increment(1);
                warn!(
                    request_id = %ctx.request_id,
                    fingerprint = alert.fingerprint,
                    error = %e,
                    "failed to reach alert pipeline"
                );
                return Err(SinkError::Unavailable(e.to_string()));
            }
        };

        let status = response.status();
        counter!(METRIC_SINK_REQUESTS, "result" => status.as_str().to_string()).increment(1);
        if status == StatusCode::NOT_FOUND {
            warn!(
                request_id = %ctx.request_id,
                fingerprint = alert.fingerprint,
                "pipeline has no dedup state for alert, treating it as new"
            );
        }
        classify(status)
    }
}

fn classify(status: StatusCode) -> Result<(), SinkError> {
    if status.is_success() || status == StatusCode::NOT_FOUND {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(SinkError::Unavailable(format!("pipeline answered {status}")))
    } else {
        Err(SinkError::Rejected(format!("pipeline answered {status}")))
    }
}
