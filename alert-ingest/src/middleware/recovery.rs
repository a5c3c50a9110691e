use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use tracing::error;

use crate::api::WebhookError;
use crate::context::RequestId;
use crate::middleware::request_id::REQUEST_ID_HEADER;
use crate::prometheus::report_internal_error_metrics;

/// Recovery wraps the request-id layer, so it cannot read the id from the
/// request extensions. It plants this slot instead, the inner layer fills it.
#[derive(Clone, Debug, Default)]
pub struct RequestIdSlot(Arc<OnceLock<RequestId>>);

impl RequestIdSlot {
    pub fn fill(&self, request_id: RequestId) {
        // Only the first assignment counts
        self.0.get_or_init(|| request_id);
    }

    pub fn get(&self) -> Option<RequestId> {
        self.0.get().cloned()
    }
}

pub async fn catch_panic(mut req: Request, next: Next) -> Response {
    let slot = RequestIdSlot::default();
    req.extensions_mut().insert(slot.clone());

    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let request_id = slot.get().unwrap_or_else(RequestId::generate);
            error!(
                request_id = %request_id,
                method = %method,
                path = path,
                panic = panic_message(panic.as_ref()),
                "handler panicked"
            );
            report_internal_error_metrics("panic", "handler");

            let mut response = WebhookError::Internal.into_response_for(&request_id);
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            response
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
