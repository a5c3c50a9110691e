#[path = "common/utils.rs"]
mod utils;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hmac::{Hmac, Mac};
use limiters::{
    ClientRateLimiter, ClientRateLimiterConfig, GlobalRateLimiter, InMemoryStore,
};
use serde_json::Value;
use sha2::Sha256;

use alert_ingest::middleware::auth::Authenticator;
use alert_ingest::middleware::rate_limit::RateLimiting;
use alert_ingest::middleware::timeout::TimeoutConfig;
use alert_ingest::router::{Guards, IngestLimits};

use utils::{
    alertmanager, firing, json_request, send, timeouts, PanickingClock, TestApp, TestAppBuilder,
};

fn payload() -> Value {
    alertmanager(vec![firing("HighLatency")])
}

fn with_header(mut request: Request<Body>, name: &'static str, value: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(name, value.parse().unwrap());
    request
}

fn rate_limited_app(client_threshold: u64, global_threshold: u64) -> TestApp {
    let client = ClientRateLimiter::new(
        ClientRateLimiterConfig {
            threshold: client_threshold,
            window_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(1),
        },
        Arc::new(InMemoryStore::new()),
    );
    let global = GlobalRateLimiter::new(global_threshold, Duration::from_secs(60));

    TestAppBuilder::new()
        .guards(Guards {
            rate_limiting: Some(Arc::new(RateLimiting {
                client,
                global,
                known_clients: HashSet::from([
                    "alertmanager-eu".to_string(),
                    "alertmanager-us".to_string(),
                ]),
            })),
            ..Guards::open(timeouts())
        })
        .build()
}

fn authenticated_app(authenticator: Authenticator) -> TestApp {
    TestAppBuilder::new()
        .guards(Guards {
            authenticator: Arc::new(authenticator),
            ..Guards::open(timeouts())
        })
        .build()
}

fn signature(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn limits_each_client_separately() {
    let app = rate_limited_app(3, 1000);

    for _ in 0..3 {
        let res = send(
            &app.router,
            with_header(json_request(&payload()), "x-client-id", "alertmanager-eu"),
        )
        .await;
        assert_eq!(res.status, StatusCode::OK);
    }

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-client-id", "alertmanager-eu"),
    )
    .await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.body["status"], "rejected");
    let retry_after: u64 = res.header("retry-after").parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(res.body["requestId"], res.header("x-request-id"));

    // Another client still has its whole budget
    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-client-id", "alertmanager-us"),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);

    assert_eq!(app.sink.len(), 4);
}

#[tokio::test]
async fn rotating_client_ids_share_one_window() {
    // Unknown ids fall back to the caller address, so inventing a new id per
    // request does not buy a fresh budget
    let app = rate_limited_app(1, 1000);

    let mut accepted = 0;
    for i in 0..20 {
        let client = format!("rotating-{i}");
        let res = send(
            &app.router,
            with_header(json_request(&payload()), "x-client-id", &client),
        )
        .await;
        if res.status == StatusCode::OK {
            accepted += 1;
        } else {
            assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(app.sink.len(), 1);
}

#[tokio::test]
async fn global_limit_applies_across_clients() {
    let app = rate_limited_app(100, 2);

    for client in ["alertmanager-eu", "alertmanager-us"] {
        let res = send(
            &app.router,
            with_header(json_request(&payload()), "x-client-id", client),
        )
        .await;
        assert_eq!(res.status, StatusCode::OK);
    }

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-client-id", "alertmanager-eu"),
    )
    .await;
    assert_eq!(res.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(res.header("retry-after").parse::<u64>().unwrap() >= 1);
}

#[tokio::test]
async fn token_auth_guards_the_webhook() {
    let app = authenticated_app(Authenticator::token("whk_secret"));

    let res = send(&app.router, json_request(&payload())).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert_eq!(res.body["status"], "rejected");

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-webhook-token", "whk_wrong"),
    )
    .await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-webhook-token", "whk_secret"),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "authorization", "Bearer whk_secret"),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);

    assert_eq!(app.sink.len(), 2);
}

#[tokio::test]
async fn hmac_auth_checks_the_body_signature() {
    let app = authenticated_app(Authenticator::hmac(
        b"hook-key".to_vec(),
        1024 * 1024,
        Duration::from_secs(5),
    ));
    let body = payload().to_string();

    let res = send(&app.router, json_request(&payload())).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let signed = |body: &str, signature: &str| {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-signature-256", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let good = signature(b"hook-key", body.as_bytes());
    let res = send(&app.router, signed(&body, &good)).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["alertsProcessed"], 1);

    let tampered = body.replace("HighLatency", "LowLatency");
    let res = send(&app.router, signed(&tampered, &good)).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let wrong_key = signature(b"other-key", body.as_bytes());
    let res = send(&app.router, signed(&body, &wrong_key)).await;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    assert_eq!(app.sink.len(), 1);
}

#[tokio::test]
async fn cors_preflight_skips_authentication() {
    let app = authenticated_app(Authenticator::token("whk_secret"));
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/webhook")
        .header(header::ORIGIN, "https://status.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let res = send(&app.router, request).await;

    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(
        res.header("access-control-allow-origin"),
        "https://status.example.com"
    );
}

fn small_body_app(max_body_bytes: usize) -> TestApp {
    TestAppBuilder::new()
        .limits(IngestLimits {
            max_body_bytes,
            ..IngestLimits::default()
        })
        .build()
}

#[tokio::test]
async fn refuses_declared_oversized_bodies() {
    let app = small_body_app(64);
    let body = payload().to_string();
    assert!(body.len() > 64);

    let request = with_header(
        json_request(&payload()),
        "content-length",
        &body.len().to_string(),
    );
    let res = send(&app.router, request).await;

    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(res.body["status"], "rejected");
    assert_eq!(app.sink.len(), 0);
}

#[tokio::test]
async fn refuses_streamed_oversized_bodies() {
    let app = small_body_app(64);
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..4)
        .map(|_| Ok(Bytes::from_static(&[b' '; 32])))
        .collect();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream::iter(chunks)))
        .unwrap();

    let res = send(&app.router, request).await;

    assert_eq!(res.status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn recovers_from_handler_panics() {
    let app = TestAppBuilder::new().timesource(PanickingClock {}).build();

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-request-id", "req-from-sender"),
    )
    .await;

    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.body["status"], "failure");
    assert_eq!(res.body["requestId"], "req-from-sender");
    assert_eq!(res.header("x-request-id"), "req-from-sender");
    // Panic details stay in the logs
    assert!(!res.body["message"].as_str().unwrap().contains("clock"));

    // The service keeps serving afterwards
    let res = send(&app.router, json_request(&payload())).await;
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!res.header("x-request-id").is_empty());
}

#[tokio::test]
async fn echoes_or_assigns_request_ids() {
    let app = utils::setup();

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-request-id", "am-7f3a"),
    )
    .await;
    assert_eq!(res.header("x-request-id"), "am-7f3a");
    assert_eq!(res.body["requestId"], "am-7f3a");

    let oversized = "x".repeat(129);
    let res = send(
        &app.router,
        with_header(json_request(&payload()), "x-request-id", &oversized),
    )
    .await;
    let assigned = res.header("x-request-id");
    assert_ne!(assigned, oversized);
    assert_eq!(assigned.len(), 36);
    assert_eq!(res.body["requestId"], assigned);
}

#[tokio::test(start_paused = true)]
async fn stalled_bodies_time_out() {
    // The body reader gives up before the request deadline
    let app = TestAppBuilder::new()
        .limits(IngestLimits {
            body_chunk_timeout: Duration::from_millis(200),
            ..IngestLimits::default()
        })
        .build();

    let stalled = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("{\"alerts\":"))])
        .chain(stream::pending());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stalled))
        .unwrap();

    let res = send(&app.router, request).await;
    assert_eq!(res.status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(res.body["status"], "rejected");
}

#[tokio::test(start_paused = true)]
async fn overrunning_the_grace_period_is_a_gateway_timeout() {
    // Body chunks may take longer than the whole request is allowed to
    let app = TestAppBuilder::new()
        .limits(IngestLimits {
            body_chunk_timeout: Duration::from_secs(60),
            ..IngestLimits::default()
        })
        .guards(Guards::open(TimeoutConfig {
            request_timeout: Duration::from_secs(1),
            grace: Duration::from_millis(500),
        }))
        .build();

    let stalled = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("{\"alerts\":"))])
        .chain(stream::pending());
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stalled))
        .unwrap();

    let res = send(&app.router, request).await;
    assert_eq!(res.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(res.body["status"], "failure");
    assert!(!res.header("x-request-id").is_empty());
}

#[tokio::test]
async fn compresses_responses_on_request() {
    let app = utils::setup();

    let res = send(
        &app.router,
        with_header(json_request(&payload()), "accept-encoding", "gzip"),
    )
    .await;

    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.header("content-encoding"), "gzip");
}
