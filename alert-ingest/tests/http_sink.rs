use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use httpmock::prelude::*;
use tokio::net::TcpListener;

use alert_ingest::alert::{Alert, AlertStatus, AnnotationValue};
use alert_ingest::context::{RequestContext, RequestId};
use alert_ingest::sinks::http::HttpSink;
use alert_ingest::sinks::{AlertSink, SinkError};

fn alert(name: &str) -> Alert {
    let labels = BTreeMap::from([
        ("alertname".to_string(), name.to_string()),
        ("severity".to_string(), "warning".to_string()),
    ]);
    let annotations = BTreeMap::from([(
        "summary".to_string(),
        AnnotationValue::String(format!("{name} fired")),
    )]);
    Alert {
        fingerprint: "2c5b1a3f09d4e7c8".to_string(),
        status: AlertStatus::Firing,
        labels,
        annotations,
        starts_at: Utc.with_ymd_and_hms(2024, 5, 1, 11, 58, 0).unwrap(),
        ends_at: None,
        generator_url: None,
        received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        source_request_id: "am-42".to_string(),
    }
}

fn ctx() -> RequestContext {
    RequestContext::new(RequestId::from("am-42"), Duration::from_secs(5))
}

fn sink(url: String) -> HttpSink {
    HttpSink::new(url, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn forwards_alerts_as_json() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/alerts")
                .header("content-type", "application/json")
                .header("x-request-id", "am-42")
                .json_body_partial(
                    r#"{
                        "fingerprint": "2c5b1a3f09d4e7c8",
                        "status": "firing",
                        "labels": {"alertname": "DiskFull", "severity": "warning"},
                        "annotations": {"summary": "DiskFull fired"},
                        "startsAt": "2024-05-01T11:58:00Z",
                        "sourceRequestID": "am-42"
                    }"#,
                );
            then.status(202);
        })
        .await;

    let result = sink(server.url("/alerts"))
        .process(&ctx(), &alert("DiskFull"))
        .await;

    assert_eq!(result, Ok(()));
    mock.assert_async().await;
}

#[tokio::test]
async fn maps_pipeline_answers_to_sink_errors() {
    let server = MockServer::start_async().await;
    for (path, status) in [("/conflict", 409), ("/missing", 404), ("/overloaded", 503)] {
        server
            .mock_async(|when, then| {
                when.method(POST).path(path);
                then.status(status);
            })
            .await;
    }

    let result = sink(server.url("/conflict"))
        .process(&ctx(), &alert("DiskFull"))
        .await;
    assert!(matches!(result, Err(SinkError::Rejected(_))), "{result:?}");

    // No dedup state yet, the alert is new
    let result = sink(server.url("/missing"))
        .process(&ctx(), &alert("DiskFull"))
        .await;
    assert_eq!(result, Ok(()));

    let result = sink(server.url("/overloaded"))
        .process(&ctx(), &alert("DiskFull"))
        .await;
    assert!(matches!(result, Err(SinkError::Unavailable(_))));
}

#[tokio::test]
async fn unreachable_pipeline_is_unavailable() {
    // Grab a free port and release it so nothing listens there
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = sink(format!("http://{addr}/alerts"))
        .process(&ctx(), &alert("DiskFull"))
        .await;

    assert!(matches!(result, Err(SinkError::Unavailable(_))));
}

#[tokio::test]
async fn gives_up_once_the_request_is_cancelled() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/alerts");
            then.status(200).delay(Duration::from_secs(30));
        })
        .await;

    let ctx = ctx();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = sink(server.url("/alerts"))
        .process(&ctx, &alert("DiskFull"))
        .await;

    assert!(matches!(result, Err(SinkError::Unavailable(_))));
}
