use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

use crate::alert::{Alert, AlertStatus};
use crate::parse::ParsedWebhook;

const FINGERPRINT_SEPARATOR: u8 = 0xff;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("alert {index} has no valid status")]
    InvalidStatus { index: usize },
    #[error("alert {index} has an unparseable {field}: {message}")]
    InvalidTimestamp {
        index: usize,
        field: &'static str,
        message: String,
    },
}

/// Metadata attached to every alert of one request. None of it feeds the
/// fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct ConversionContext<'a> {
    pub received_at: DateTime<Utc>,
    pub request_id: &'a str,
}

/// Stable identity of an alert, computed from its label set only.
///
/// Pairs are fed in key order as `key 0xFF value 0xFF`; 0xFF never occurs in
/// UTF-8, so distinct label sets cannot produce the same byte stream. The first
/// 8 bytes of the SHA-256 digest are rendered as 16 hex characters.
pub fn fingerprint(labels: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in labels {
        hasher.update(key.as_bytes());
        hasher.update([FINGERPRINT_SEPARATOR]);
        hasher.update(value.as_bytes());
        hasher.update([FINGERPRINT_SEPARATOR]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Convert a validated document into alerts. Failing here means validation let
/// something through it should not have.
#[instrument(skip_all, fields(alerts = parsed.alerts.len(), request_id = ctx.request_id))]
pub fn convert(
    parsed: &ParsedWebhook,
    ctx: &ConversionContext<'_>,
) -> Result<Vec<Alert>, ConversionError> {
    parsed
        .alerts
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let status = entry
                .status
                .as_deref()
                .and_then(AlertStatus::parse)
                .ok_or(ConversionError::InvalidStatus { index })?;

            let starts_at = timestamp(entry.starts_at.as_deref(), index, "startsAt")?
                .unwrap_or(ctx.received_at);
            let ends_at = timestamp(entry.ends_at.as_deref(), index, "endsAt")?;

            Ok(Alert {
                fingerprint: fingerprint(&entry.labels),
                status,
                labels: entry.labels.clone(),
                annotations: entry.annotations.clone(),
                starts_at,
                ends_at,
                generator_url: entry.generator_url.clone(),
                received_at: ctx.received_at,
                source_request_id: ctx.request_id.to_string(),
            })
        })
        .collect()
}

fn timestamp(
    raw: Option<&str>,
    index: usize,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ConversionError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| ConversionError::InvalidTimestamp {
                index,
                field,
                message: e.to_string(),
            })
    })
    .transpose()
}
