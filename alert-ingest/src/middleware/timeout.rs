use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::error;

use crate::api::WebhookError;
use crate::context::RequestContext;
use crate::middleware::request_id::current_request_id;

const METRIC_REQUEST_TIMED_OUT: &str = "middleware_request_timed_out_total";

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Deadline handed to the handler and its alert jobs
    pub request_timeout: Duration,
    /// Extra time the handler gets to compose its response after the deadline
    pub grace: Duration,
}

/// Give the handler its `RequestContext` and bound the whole request.
///
/// The handler is expected to answer on its own once the deadline passes,
/// reporting pending alerts as timed out. Only when it also overruns the grace
/// period is it dropped and a 504 returned.
pub async fn apply_deadline(
    State(config): State<TimeoutConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = current_request_id(req.extensions());
    let ctx = RequestContext::new(request_id.clone(), config.request_timeout);
    let cancel = ctx.cancel.clone();
    req.extensions_mut().insert(ctx);

    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    match tokio::time::timeout(config.request_timeout + config.grace, next.run(req)).await {
        Ok(response) => response,
        Err(_elapsed) => {
            cancel.cancel();
            metrics::counter!(METRIC_REQUEST_TIMED_OUT, "path" => path.clone()).increment(1);
            error!(
                request_id = %request_id,
                method = %method,
                path = path,
                timeout_ms = (config.request_timeout + config.grace).as_millis() as u64,
                "request exceeded its deadline"
            );
            WebhookError::Timeout.into_response_for(&request_id)
        }
    }
}
