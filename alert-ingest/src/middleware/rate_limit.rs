use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum_client_ip::InsecureClientIp;
use limiters::{ClientRateLimiter, EvalResult, GlobalRateLimiter};
use tracing::warn;

use crate::api::WebhookError;
use crate::middleware::request_id::current_request_id;
use crate::prometheus::report_dropped_alerts;

pub const CLIENT_ID_HEADER: &str = "x-client-id";
const UNKNOWN_CLIENT: &str = "unknown";

/// Both limiters guarding the webhook routes. The per-client window is
/// checked first so a single noisy client does not eat the global budget.
pub struct RateLimiting {
    pub client: ClientRateLimiter,
    pub global: GlobalRateLimiter,
    /// Client ids that get their own window. Any other id is ignored.
    pub known_clients: HashSet<String>,
}

/// The caller's IP address, unless it names a configured client id.
///
/// Arbitrary ids are not trusted: a sender rotating them would get a fresh
/// window per request and grow the limiter state without bound.
pub fn client_key(
    headers: &HeaderMap,
    client_ip: Option<&InsecureClientIp>,
    known_clients: &HashSet<String>,
) -> String {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| known_clients.contains(*id))
        .map(|id| format!("client:{id}"))
        .or_else(|| client_ip.map(|ip| ip.0.to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Whole seconds to wait, rounded up, never less than one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

fn rejection(result: &EvalResult) -> Option<u64> {
    match result {
        EvalResult::Limited(response) => Some(retry_after_secs(response.retry_after)),
        EvalResult::FailClosed => Some(1),
        EvalResult::Allowed { .. } | EvalResult::FailOpen { .. } => None,
    }
}

pub async fn enforce_rate_limits(
    State(limits): State<Option<Arc<RateLimiting>>>,
    client_ip: Option<InsecureClientIp>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limits) = limits else {
        return next.run(req).await;
    };

    let key = client_key(req.headers(), client_ip.as_ref(), &limits.known_clients);

    let client = limits.client.check_limit(&key).await;
    if let Some(retry_after_secs) = rejection(&client) {
        warn!(client = key, retry_after_secs, "client rate limit exceeded");
        report_dropped_alerts("client_rate_limited", 1);
        return WebhookError::RateLimited { retry_after_secs }
            .into_response_for(&current_request_id(req.extensions()));
    }

    let global = limits.global.check_limit();
    if let Some(retry_after_secs) = rejection(&global) {
        warn!(
            client = key,
            retry_after_secs,
            result = global.as_tag(),
            "global rate limit exceeded"
        );
        report_dropped_alerts("global_rate_limited", 1);
        return WebhookError::RateLimited { retry_after_secs }
            .into_response_for(&current_request_id(req.extensions()));
    }

    next.run(req).await
}
