use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics::gauge;

const METRIC_HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
const METRIC_HTTP_REQUESTS_DURATION_SECONDS: &str = "http_requests_duration_seconds";
const METRIC_HTTP_REQUESTS_IN_FLIGHT: &str = "http_requests_in_flight";

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

// Decrements on drop so the gauge stays right when the handler panics
struct InFlightGuard;

impl InFlightGuard {
    fn enter() -> Self {
        let current = IN_FLIGHT.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!(METRIC_HTTP_REQUESTS_IN_FLIGHT).set(current as f64);
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let current = IN_FLIGHT.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        gauge!(METRIC_HTTP_REQUESTS_IN_FLIGHT).set(current as f64);
    }
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let _guard = InFlightGuard::enter();
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!(METRIC_HTTP_REQUESTS_TOTAL, &labels).increment(1);
    metrics::histogram!(METRIC_HTTP_REQUESTS_DURATION_SECONDS, &labels).record(latency);

    response
}
