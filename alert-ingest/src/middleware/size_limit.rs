use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::api::WebhookError;
use crate::middleware::request_id::current_request_id;
use crate::prometheus::report_dropped_alerts;

/// Turn away requests whose declared length is over the ceiling before any of
/// the body is read. Bodies without a usable Content-Length are left to the
/// streaming reader, which enforces the same ceiling.
pub async fn limit_declared_size(
    State(max_body_bytes): State<usize>,
    req: Request,
    next: Next,
) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(declared) = declared {
        if declared > max_body_bytes as u64 {
            warn!(declared, limit = max_body_bytes, "request body too large");
            report_dropped_alerts("payload_too_large", 1);
            return WebhookError::PayloadTooLarge {
                limit: max_body_bytes,
            }
            .into_response_for(&current_request_id(req.extensions()));
        }
    }

    next.run(req).await
}
