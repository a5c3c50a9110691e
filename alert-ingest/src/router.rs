use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::RequestId;
use crate::endpoint;
use crate::middleware::auth::{authenticate, Authenticator};
use crate::middleware::http_metrics::track_metrics;
use crate::middleware::rate_limit::{enforce_rate_limits, RateLimiting};
use crate::middleware::recovery::catch_panic;
use crate::middleware::request_id::assign_request_id;
use crate::middleware::size_limit::limit_declared_size;
use crate::middleware::timeout::{apply_deadline, TimeoutConfig};
use crate::processor::AlertProcessor;
use crate::time::TimeSource;
use crate::validate::ValidationRules;

#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    pub max_body_bytes: usize,
    pub max_alerts_per_request: usize,
    /// Longest pause allowed between two chunks of a request body
    pub body_chunk_timeout: Duration,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            max_alerts_per_request: 1000,
            body_chunk_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<AlertProcessor>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub limits: IngestLimits,
    pub rules: ValidationRules,
}

/// Everything the middleware chain needs besides the handler state.
pub struct Guards {
    /// None turns rate limiting off
    pub rate_limiting: Option<Arc<RateLimiting>>,
    pub authenticator: Arc<Authenticator>,
    pub timeouts: TimeoutConfig,
}

impl Guards {
    pub fn open(timeouts: TimeoutConfig) -> Self {
        Self {
            rate_limiting: None,
            authenticator: Arc::new(Authenticator::Disabled),
            timeouts,
        }
    }
}

async fn index() -> &'static str {
    "alert-ingest"
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: AppState, guards: Guards, metrics: Option<PrometheusHandle>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(RequestId::to_string)
            .unwrap_or_default();
        tracing::info_span!(
            "request",
            method = %req.method(),
            uri = %req.uri(),
            request_id = %request_id
        )
    });

    // Outermost first
    let chain = ServiceBuilder::new()
        .layer(from_fn(catch_panic))
        .layer(from_fn(assign_request_id))
        .layer(trace)
        .layer(from_fn(track_metrics))
        .layer(from_fn_with_state(guards.rate_limiting, enforce_rate_limits))
        .layer(from_fn_with_state(guards.authenticator, authenticate))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(from_fn_with_state(
            state.limits.max_body_bytes,
            limit_declared_size,
        ))
        .layer(from_fn_with_state(guards.timeouts, apply_deadline));

    let webhook = Router::new()
        // Senders disagree on the trailing slash
        .route(endpoint::WEBHOOK_PATH, post(endpoint::webhook))
        .route("/webhook/", post(endpoint::webhook))
        .layer(chain)
        .with_state(state);

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(health))
        .route("/_liveness", get(health))
        .merge(webhook);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    match metrics {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    }
}
