use axum::extract::Request;
use axum::http::{Extensions, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

use crate::context::RequestId;
use crate::middleware::recovery::RequestIdSlot;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const MAX_REQUEST_ID_LENGTH: usize = 128;

/// Accept a caller-supplied id only if it is short and printable, anything
/// else would end up verbatim in logs and response headers.
pub fn is_well_formed(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LENGTH
        && id.bytes().all(|b| b.is_ascii_graphic())
}

/// Id assigned to the request by `assign_request_id`. Layers running outside
/// of it get a fresh one.
pub fn current_request_id(extensions: &Extensions) -> RequestId {
    extensions
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(RequestId::generate)
}

pub async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_well_formed(id))
        .map(RequestId::from)
        .unwrap_or_else(RequestId::generate);

    if let Some(slot) = req.extensions().get::<RequestIdSlot>() {
        slot.fill(request_id.clone());
    }
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
