use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::instrument;
use url::Url;

use crate::alert::{AlertStatus, ALERTNAME_LABEL};
use crate::convert::fingerprint;
use crate::parse::{ParsedAlert, ParsedWebhook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    pub max_label_key_len: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_label_key_len: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub index: usize,
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(index: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            index,
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<FieldError>,
}

/// Check every entry of a parsed webhook and collect all problems found.
///
/// A failing entry never stops the others from being checked, so callers get
/// the complete list in one round trip. Errors come out ordered by entry index.
#[instrument(skip_all, fields(alerts = parsed.alerts.len()))]
pub fn validate(parsed: &ParsedWebhook, rules: &ValidationRules) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, alert) in parsed.alerts.iter().enumerate() {
        validate_entry(index, alert, rules, &mut errors, &mut warnings);

        if alert.labels.is_empty() {
            continue;
        }
        let fp = fingerprint(&alert.labels);
        if let Some(first) = seen.get(&fp) {
            warnings.push(FieldError::new(
                index,
                "labels",
                format!("same label set as alert {first}, fingerprint {fp}"),
            ));
        } else {
            seen.insert(fp, index);
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn validate_entry(
    index: usize,
    alert: &ParsedAlert,
    rules: &ValidationRules,
    errors: &mut Vec<FieldError>,
    warnings: &mut Vec<FieldError>,
) {
    let status = match alert.status.as_deref() {
        None => {
            errors.push(FieldError::new(index, "status", "status is required"));
            None
        }
        Some(raw) => {
            let status = AlertStatus::parse(raw);
            if status.is_none() {
                errors.push(FieldError::new(
                    index,
                    "status",
                    format!("status must be one of firing, resolved, got {raw:?}"),
                ));
            }
            status
        }
    };

    let has_name = alert
        .labels
        .get(ALERTNAME_LABEL)
        .is_some_and(|name| !name.trim().is_empty());
    if !has_name {
        errors.push(FieldError::new(
            index,
            "labels.alertname",
            "alertname label is required and must not be empty",
        ));
    }

    for key in alert.labels.keys() {
        if key.len() > rules.max_label_key_len {
            errors.push(FieldError::new(
                index,
                format!("labels.{key}"),
                format!("label name exceeds {} bytes", rules.max_label_key_len),
            ));
        } else if !is_valid_label_name(key) {
            errors.push(FieldError::new(
                index,
                format!("labels.{key}"),
                "label name must only contain letters, digits and underscores",
            ));
        }
    }

    let starts_at = timestamp(index, "startsAt", alert.starts_at.as_deref(), errors);
    let ends_at = timestamp(index, "endsAt", alert.ends_at.as_deref(), errors);

    match status {
        Some(AlertStatus::Resolved) => {
            if alert.ends_at.is_none() {
                errors.push(FieldError::new(
                    index,
                    "endsAt",
                    "endsAt is required for resolved alerts",
                ));
            }
            if let (Some(start), Some(end)) = (starts_at, ends_at) {
                if end < start {
                    errors.push(FieldError::new(
                        index,
                        "endsAt",
                        "endsAt must not precede startsAt",
                    ));
                }
            }
        }
        Some(AlertStatus::Firing) => {
            if let (Some(start), Some(end)) = (starts_at, ends_at) {
                if end < start {
                    warnings.push(FieldError::new(
                        index,
                        "endsAt",
                        "firing alert ends before it starts",
                    ));
                }
            }
        }
        None => {}
    }

    if let Some(raw) = alert.generator_url.as_deref() {
        if let Err(e) = Url::parse(raw) {
            errors.push(FieldError::new(
                index,
                "generatorURL",
                format!("generatorURL must be an absolute URL: {e}"),
            ));
        }
    }
}

fn is_valid_label_name(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn timestamp(
    index: usize,
    field: &str,
    raw: Option<&str>,
    errors: &mut Vec<FieldError>,
) -> Option<DateTime<FixedOffset>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at),
        Err(e) => {
            errors.push(FieldError::new(
                index,
                field,
                format!("{field} must be an RFC 3339 timestamp: {e}"),
            ));
            None
        }
    }
}
