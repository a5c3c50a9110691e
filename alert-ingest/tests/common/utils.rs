#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use alert_ingest::alert::Alert;
use alert_ingest::context::RequestContext;
use alert_ingest::middleware::timeout::TimeoutConfig;
use alert_ingest::processor::{AlertProcessor, ProcessorConfig};
use alert_ingest::router::{router, AppState, Guards, IngestLimits};
use alert_ingest::sinks::{AlertSink, SinkError};
use alert_ingest::time::TimeSource;
use alert_ingest::validate::ValidationRules;

/// Keeps every alert it accepts. Alerts named `fail*` are rejected, `down*`
/// report the pipeline as unavailable and `slow*` never finish in time.
#[derive(Default, Clone)]
pub struct MemorySink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn process(&self, _: &RequestContext, alert: &Alert) -> Result<(), SinkError> {
        let name = alert.name();
        if name.starts_with("fail") {
            return Err(SinkError::Rejected("duplicate alert".to_string()));
        }
        if name.starts_with("down") {
            return Err(SinkError::Unavailable("store offline".to_string()));
        }
        if name.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

impl MemorySink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Blows up while the handler stamps alerts, to exercise panic recovery.
pub struct PanickingClock {}

impl TimeSource for PanickingClock {
    fn now(&self) -> DateTime<Utc> {
        panic!("clock is broken")
    }
}

pub fn received_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn timeouts() -> TimeoutConfig {
    TimeoutConfig {
        request_timeout: Duration::from_secs(5),
        grace: Duration::from_secs(1),
    }
}

pub struct TestApp {
    pub router: Router,
    pub sink: MemorySink,
}

pub struct TestAppBuilder {
    guards: Guards,
    limits: IngestLimits,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    processor: ProcessorConfig,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            guards: Guards::open(timeouts()),
            limits: IngestLimits::default(),
            timesource: Arc::new(FixedTime {
                time: received_at(),
            }),
            processor: ProcessorConfig::default(),
        }
    }

    pub fn guards(mut self, guards: Guards) -> Self {
        self.guards = guards;
        self
    }

    pub fn limits(mut self, limits: IngestLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn timesource(mut self, timesource: impl TimeSource + Send + Sync + 'static) -> Self {
        self.timesource = Arc::new(timesource);
        self
    }

    pub fn processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn build(self) -> TestApp {
        let sink = MemorySink::default();
        let state = AppState {
            processor: Arc::new(AlertProcessor::new(Arc::new(sink.clone()), self.processor)),
            timesource: self.timesource,
            limits: self.limits,
            rules: ValidationRules::default(),
        };

        TestApp {
            router: router(state, self.guards, None),
            sink,
        }
    }
}

pub fn setup() -> TestApp {
    TestAppBuilder::new().build()
}

pub fn firing(name: &str) -> Value {
    json!({
        "status": "firing",
        "labels": {"alertname": name, "instance": format!("{name}-1"), "severity": "critical"},
        "annotations": {"summary": format!("{name} is firing")},
        "startsAt": "2024-05-01T11:58:00Z",
        "endsAt": "0001-01-01T00:00:00Z",
        "generatorURL": "http://prometheus:9090/graph?g0.expr=up"
    })
}

/// Alertmanager webhook envelope around `alerts`.
pub fn alertmanager(alerts: Vec<Value>) -> Value {
    json!({
        "version": "4",
        "groupKey": "{}:{alertname=\"HighLatency\"}",
        "truncatedAlerts": 0,
        "status": "firing",
        "receiver": "alert-ingest",
        "groupLabels": {"alertname": "HighLatency"},
        "commonLabels": {"severity": "critical"},
        "commonAnnotations": {},
        "externalURL": "http://alertmanager:9093",
        "alerts": alerts
    })
}

pub fn json_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .unwrap_or_else(|| panic!("missing {name} header"))
            .to_str()
            .unwrap()
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post_json(router: &Router, body: &Value) -> TestResponse {
    send(router, json_request(body)).await
}
