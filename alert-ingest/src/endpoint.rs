use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use tracing::{debug, error, instrument, warn, Span};

use crate::api::{outcome_status_code, WebhookError, WebhookResponse};
use crate::context::RequestContext;
use crate::convert::{convert, ConversionContext};
use crate::detect::{detect, DetectedFormat};
use crate::extractors::{extract_body_with_timeout, inflate_if_gzip};
use crate::parse::parse;
use crate::processor::{ProcessingOutcome, ProcessingStatus};
use crate::prometheus::{
    report_dropped_alerts, report_internal_error_metrics, report_webhook_outcome,
};
use crate::router::AppState;
use crate::validate::validate;

pub const WEBHOOK_PATH: &str = "/webhook";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";
pub const ALERTS_PROCESSED_HEADER: &str = "x-alerts-processed";

/// A declared content type must be JSON, a missing one is tolerated since
/// several senders omit it.
fn check_content_type(headers: &HeaderMap) -> Result<(), WebhookError> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(());
    };
    let declared = value
        .to_str()
        .map_err(|_| WebhookError::UnsupportedContentType("<non-ascii>".to_string()))?;

    let mime = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if mime == "application/json" || mime.ends_with("+json") {
        Ok(())
    } else {
        Err(WebhookError::UnsupportedContentType(declared.to_string()))
    }
}

async fn read_payload(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Bytes, WebhookError> {
    check_content_type(headers)?;
    let raw = extract_body_with_timeout(
        body,
        state.limits.max_body_bytes,
        state.limits.body_chunk_timeout,
        WEBHOOK_PATH,
    )
    .await?;
    inflate_if_gzip(raw, state.limits.max_body_bytes)
}

async fn ingest(
    state: &AppState,
    ctx: &RequestContext,
    payload: &[u8],
    detected: &DetectedFormat,
) -> Result<ProcessingOutcome, WebhookError> {
    let parsed = parse(payload, detected, state.limits.max_alerts_per_request)?;
    Span::current().record("alerts", parsed.alerts.len());

    let validation = validate(&parsed, &state.rules);
    for warning in &validation.warnings {
        warn!(
            index = warning.index,
            field = warning.field,
            "{}",
            warning.message
        );
    }
    if !validation.valid {
        report_dropped_alerts("validation_failed", parsed.alerts.len() as u64);
        return Err(WebhookError::Validation {
            received: parsed.alerts.len(),
            errors: validation.errors,
        });
    }

    let alerts = convert(
        &parsed,
        &ConversionContext {
            received_at: state.timesource.now(),
            request_id: ctx.request_id.as_str(),
        },
    )
    .map_err(|err| {
        // Validation should have caught this
        error!(error = %err, "failed to convert validated alerts");
        report_internal_error_metrics("conversion", "convert");
        err
    })?;

    let fingerprints: Vec<String> = alerts.iter().map(|a| a.fingerprint.clone()).collect();
    let received = alerts.len();
    let outcomes = state
        .processor
        .process_batch(alerts, ctx)
        .await
        .map_err(|source| WebhookError::Processor { received, source })?;

    Ok(ProcessingOutcome::from_outcomes(&fingerprints, outcomes))
}

fn with_timing(mut response: Response, started: Instant, processed: usize) -> Response {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let headers = response.headers_mut();
    headers.insert(PROCESSING_TIME_HEADER, HeaderValue::from(elapsed_ms));
    headers.insert(ALERTS_PROCESSED_HEADER, HeaderValue::from(processed));
    response
}

fn fail(
    err: WebhookError,
    ctx: &RequestContext,
    format: &'static str,
    started: Instant,
) -> Response {
    match err.status_code().as_u16() {
        500.. => error!(error = %err, "webhook request failed"),
        _ => debug!(error = %err, "webhook request refused"),
    }
    report_webhook_outcome(format, err.to_metric_tag());

    let body = err.body(&ctx.request_id).with_processing_time(started.elapsed());
    with_timing(err.into_response_with(body), started, 0)
}

#[instrument(
    skip_all,
    fields(
        request_id = %ctx.request_id,
        format = tracing::field::Empty,
        alerts = tracing::field::Empty
    )
)]
pub async fn webhook(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();

    let payload = match read_payload(&state, &headers, body).await {
        Ok(payload) => payload,
        Err(err) => return fail(err, &ctx, "unknown", started),
    };

    let detected = detect(&payload);
    let format = detected.variant.as_str();
    Span::current().record("format", format);
    debug!(confidence = detected.confidence, "detected webhook format");

    let outcome = match ingest(&state, &ctx, &payload, &detected).await {
        Ok(outcome) => outcome,
        Err(err) => return fail(err, &ctx, format, started),
    };

    match outcome.status {
        ProcessingStatus::Success => {}
        ProcessingStatus::PartialSuccess | ProcessingStatus::ValidationFailed => warn!(
            received = outcome.alerts_received,
            processed = outcome.alerts_processed,
            "some alerts failed processing"
        ),
        ProcessingStatus::Failure => error!(
            received = outcome.alerts_received,
            "every alert failed processing"
        ),
    }
    for failed in &outcome.per_alert_errors {
        debug!(
            index = failed.index,
            fingerprint = failed.fingerprint,
            reason = failed.reason.as_tag(),
            "alert failed"
        );
    }
    report_dropped_alerts("processing_failed", outcome.per_alert_errors.len() as u64);

    let status = match outcome.status {
        ProcessingStatus::Success => "success",
        ProcessingStatus::PartialSuccess => "partial_success",
        ProcessingStatus::ValidationFailed => "validation_failed",
        ProcessingStatus::Failure => "failure",
    };
    report_webhook_outcome(format, status);

    let body = WebhookResponse::from_outcome(&outcome, &ctx.request_id)
        .with_processing_time(started.elapsed());
    let response = (outcome_status_code(outcome.status), Json(body)).into_response();
    with_timing(response, started, outcome.alerts_processed)
}
