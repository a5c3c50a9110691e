use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::RequestId;
use crate::convert::ConversionError;
use crate::middleware::auth::AuthFailure;
use crate::parse::ParseError;
use crate::processor::{ProcessingOutcome, ProcessingStatus, ProcessorError};
use crate::validate::FieldError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    PartialSuccess,
    ValidationFailed,
    Failure,
    /// Turned away before the payload was looked at
    Rejected,
}

impl From<ProcessingStatus> for ResponseStatus {
    fn from(status: ProcessingStatus) -> Self {
        match status {
            ProcessingStatus::Success => Self::Success,
            ProcessingStatus::PartialSuccess => Self::PartialSuccess,
            ProcessingStatus::ValidationFailed => Self::ValidationFailed,
            ProcessingStatus::Failure => Self::Failure,
        }
    }
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::ValidationFailed => "validation_failed",
            Self::Failure => "failure",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub message: String,
}

impl From<&FieldError> for ErrorDetail {
    fn from(err: &FieldError) -> Self {
        Self {
            index: Some(err.index),
            field: Some(err.field.clone()),
            fingerprint: None,
            message: err.message.clone(),
        }
    }
}

/// Body of every webhook response, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: ResponseStatus,
    pub message: String,
    pub alerts_received: usize,
    pub alerts_processed: usize,
    pub errors: Vec<ErrorDetail>,
    pub processing_time_ms: u64,
    pub request_id: String,
}

impl WebhookResponse {
    pub fn from_outcome(outcome: &ProcessingOutcome, request_id: &RequestId) -> Self {
        let message = match outcome.status {
            ProcessingStatus::Success => {
                format!("processed {} alerts", outcome.alerts_processed)
            }
            ProcessingStatus::PartialSuccess => format!(
                "processed {} of {} alerts",
                outcome.alerts_processed, outcome.alerts_received
            ),
            ProcessingStatus::ValidationFailed => "alert validation failed".to_string(),
            ProcessingStatus::Failure => {
                format!("all {} alerts failed processing", outcome.alerts_received)
            }
        };

        Self {
            status: outcome.status.into(),
            message,
            alerts_received: outcome.alerts_received,
            alerts_processed: outcome.alerts_processed,
            errors: outcome
                .per_alert_errors
                .iter()
                .map(|err| ErrorDetail {
                    index: Some(err.index),
                    field: None,
                    fingerprint: Some(err.fingerprint.clone()),
                    message: err.reason.to_string(),
                })
                .collect(),
            processing_time_ms: 0,
            request_id: request_id.to_string(),
        }
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

pub fn outcome_status_code(status: ProcessingStatus) -> StatusCode {
    match status {
        ProcessingStatus::Success => StatusCode::OK,
        ProcessingStatus::PartialSuccess => StatusCode::MULTI_STATUS,
        ProcessingStatus::ValidationFailed => StatusCode::BAD_REQUEST,
        ProcessingStatus::Failure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("unsupported content type {0:?}, expected application/json")]
    UnsupportedContentType(String),
    #[error("timed out reading request body")]
    BodyReadTimeout,
    #[error("request body exceeds limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("alert validation failed with {} errors", errors.len())]
    Validation {
        received: usize,
        errors: Vec<FieldError>,
    },

    #[error("authentication failed: {0}")]
    Unauthorized(#[from] AuthFailure),
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("failed to convert alerts")]
    Conversion(#[from] ConversionError),
    #[error("{source}")]
    Processor {
        received: usize,
        #[source]
        source: ProcessorError,
    },
    #[error("request did not complete in time")]
    Timeout,
    #[error("internal server error")]
    Internal,
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RequestDecodingError(_)
            | Self::UnsupportedContentType(_)
            | Self::Parse(_)
            | Self::Validation { .. } => StatusCode::BAD_REQUEST,

            Self::BodyReadTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            Self::Conversion(_) | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Processor { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn response_status(&self) -> ResponseStatus {
        match self {
            Self::RequestDecodingError(_)
            | Self::UnsupportedContentType(_)
            | Self::Parse(_)
            | Self::Validation { .. } => ResponseStatus::ValidationFailed,

            Self::BodyReadTimeout
            | Self::PayloadTooLarge { .. }
            | Self::Unauthorized(_)
            | Self::RateLimited { .. } => ResponseStatus::Rejected,

            Self::Conversion(_) | Self::Processor { .. } | Self::Timeout | Self::Internal => {
                ResponseStatus::Failure
            }
        }
    }

    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            Self::RequestDecodingError(_) => "decoding_error",
            Self::UnsupportedContentType(_) => "unsupported_content_type",
            Self::BodyReadTimeout => "body_read_timeout",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Parse(ParseError::TooManyEntries { .. }) => "too_many_entries",
            Self::Parse(ParseError::Empty) => "empty_batch",
            Self::Parse(ParseError::UnrecognizedFormat { .. }) => "unrecognized_format",
            Self::Parse(_) => "parse_error",
            Self::Validation { .. } => "validation_failed",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::Conversion(_) => "conversion_error",
            Self::Processor {
                source: ProcessorError::Saturated,
                ..
            } => "saturated",
            Self::Processor {
                source: ProcessorError::Closed,
                ..
            } => "shutting_down",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    pub fn body(&self, request_id: &RequestId) -> WebhookResponse {
        let (alerts_received, errors) = match self {
            Self::Validation { received, errors } => {
                (*received, errors.iter().map(ErrorDetail::from).collect())
            }
            Self::Parse(err) => (
                match err {
                    ParseError::TooManyEntries { count, .. } => *count,
                    _ => 0,
                },
                vec![ErrorDetail {
                    index: None,
                    field: err.context().map(str::to_string),
                    fingerprint: None,
                    message: err.to_string(),
                }],
            ),
            Self::Processor { received, .. } => (*received, Vec::new()),
            _ => (0, Vec::new()),
        };

        WebhookResponse {
            status: self.response_status(),
            message: self.to_string(),
            alerts_received,
            alerts_processed: 0,
            errors,
            processing_time_ms: 0,
            request_id: request_id.to_string(),
        }
    }

    /// Render the error with the request id it belongs to, so a client can
    /// quote it when reporting the failure.
    pub fn into_response_for(self, request_id: &RequestId) -> Response {
        let body = self.body(request_id);
        self.into_response_with(body)
    }

    pub fn into_response_with(self, body: WebhookResponse) -> Response {
        let mut response = (self.status_code(), Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
