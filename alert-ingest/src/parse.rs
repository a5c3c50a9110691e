use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::instrument;

use crate::alert::{AnnotationValue, ALERTNAME_LABEL, SEVERITY_LABEL};
use crate::detect::{DetectedFormat, WebhookFormat};

/// Alertmanager renders an unset `endsAt` as the zero time.
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid JSON at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("unrecognized webhook format (confidence {confidence:.2})")]
    UnrecognizedFormat { confidence: f32 },
    #[error("payload is missing the {0}")]
    MissingShape(&'static str),
    #[error("invalid value at {context}: {message}")]
    InvalidField { context: String, message: String },
    #[error("request holds {count} alerts, at most {max} are accepted")]
    TooManyEntries { count: usize, max: usize },
    #[error("request holds no alert")]
    Empty,
}

impl ParseError {
    /// JSON path of the offending value, when there is one.
    pub fn context(&self) -> Option<&str> {
        match self {
            Self::InvalidField { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Syntax {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}

/// Webhook document shared by every supported format. Envelope fields are only
/// populated by Alertmanager payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWebhook {
    pub format: WebhookFormat,
    pub status: Option<String>,
    pub receiver: Option<String>,
    pub group_key: Option<String>,
    pub group_labels: BTreeMap<String, String>,
    pub common_labels: BTreeMap<String, String>,
    pub common_annotations: BTreeMap<String, AnnotationValue>,
    pub external_url: Option<String>,
    pub version: Option<String>,
    pub alerts: Vec<ParsedAlert>,
}

impl ParsedWebhook {
    fn generic(alerts: Vec<ParsedAlert>) -> Self {
        Self {
            format: WebhookFormat::Generic,
            status: None,
            receiver: None,
            group_key: None,
            group_labels: BTreeMap::new(),
            common_labels: BTreeMap::new(),
            common_annotations: BTreeMap::new(),
            external_url: None,
            version: None,
            alerts,
        }
    }
}

/// One alert entry, with values kept raw until validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAlert {
    pub status: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, AnnotationValue>,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub generator_url: Option<String>,
}

#[instrument(skip_all, fields(format = detected.variant.as_str(), len = body.len()))]
pub fn parse(
    body: &[u8],
    detected: &DetectedFormat,
    max_entries: usize,
) -> Result<ParsedWebhook, ParseError> {
    // Parse before checking confidence so syntax errors carry their position
    let value: Value = serde_json::from_slice(body)?;

    if !detected.is_confident() {
        return Err(ParseError::UnrecognizedFormat {
            confidence: detected.confidence,
        });
    }

    match detected.variant {
        WebhookFormat::Alertmanager => parse_alertmanager(&value, max_entries),
        WebhookFormat::Generic => parse_generic(&value, max_entries),
        WebhookFormat::Unknown => Err(ParseError::UnrecognizedFormat {
            confidence: detected.confidence,
        }),
    }
}

fn parse_alertmanager(value: &Value, max_entries: usize) -> Result<ParsedWebhook, ParseError> {
    let root = value
        .as_object()
        .ok_or(ParseError::MissingShape("top-level object"))?;
    let entries = root
        .get("alerts")
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingShape("alerts array"))?;
    check_entry_count(entries.len(), max_entries)?;

    let alerts = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let context = format!("alerts[{index}]");
            let entry = as_entry(entry, &context)?;
            Ok(ParsedAlert {
                status: string_field(entry, "status", &context)?,
                labels: label_map(entry.get("labels"), &format!("{context}.labels"))?,
                annotations: annotation_map(
                    entry.get("annotations"),
                    &format!("{context}.annotations"),
                )?,
                starts_at: string_field(entry, "startsAt", &context)?,
                ends_at: string_field(entry, "endsAt", &context)?.filter(|at| at != ZERO_TIME),
                generator_url: string_field(entry, "generatorURL", &context)?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(ParsedWebhook {
        format: WebhookFormat::Alertmanager,
        status: string_field(root, "status", "")?,
        receiver: string_field(root, "receiver", "")?,
        group_key: string_field(root, "groupKey", "")?,
        group_labels: label_map(root.get("groupLabels"), "groupLabels")?,
        common_labels: label_map(root.get("commonLabels"), "commonLabels")?,
        common_annotations: annotation_map(root.get("commonAnnotations"), "commonAnnotations")?,
        external_url: string_field(root, "externalURL", "")?,
        version: string_field(root, "version", "")?,
        alerts,
    })
}

fn parse_generic(value: &Value, max_entries: usize) -> Result<ParsedWebhook, ParseError> {
    let (entries, prefix): (Vec<&Value>, &str) = match value {
        Value::Array(items) => (items.iter().collect(), ""),
        Value::Object(root) => match root.get("alerts").and_then(Value::as_array) {
            Some(alerts) => (alerts.iter().collect(), "alerts"),
            None => (vec![value], ""),
        },
        _ => return Err(ParseError::MissingShape("alert object or array of alerts")),
    };
    check_entry_count(entries.len(), max_entries)?;

    let single = matches!(value, Value::Object(_)) && prefix.is_empty();
    let alerts = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let context = if single {
                String::new()
            } else {
                format!("{prefix}[{index}]")
            };
            generic_entry(as_entry(entry, &context)?, &context)
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(ParsedWebhook::generic(alerts))
}

fn generic_entry(entry: &Map<String, Value>, context: &str) -> Result<ParsedAlert, ParseError> {
    let mut labels = label_map(entry.get("labels"), &join(context, "labels"))?;
    if !labels.contains_key(ALERTNAME_LABEL) {
        if let Some(name) = first_string(entry, &["alertname", "name", "title"], context)? {
            labels.insert(ALERTNAME_LABEL.to_string(), name);
        }
    }
    if !labels.contains_key(SEVERITY_LABEL) {
        if let Some(severity) = first_string(entry, &["severity"], context)? {
            labels.insert(SEVERITY_LABEL.to_string(), severity);
        }
    }

    let mut annotations = annotation_map(entry.get("annotations"), &join(context, "annotations"))?;
    for key in ["summary", "description", "message"] {
        if annotations.contains_key(key) {
            continue;
        }
        if let Some(text) = string_field(entry, key, context)? {
            annotations.insert(key.to_string(), AnnotationValue::String(text));
        }
    }

    let status = first_string(entry, &["status", "state"], context)?
        .map(|status| status.trim().to_lowercase())
        .unwrap_or_else(|| "firing".to_string());

    Ok(ParsedAlert {
        status: Some(status),
        labels,
        annotations,
        starts_at: first_string(entry, &["startsAt", "starts_at", "timestamp"], context)?,
        ends_at: first_string(entry, &["endsAt", "ends_at"], context)?
            .filter(|at| at != ZERO_TIME),
        generator_url: first_string(entry, &["generatorURL", "url", "link"], context)?,
    })
}

fn check_entry_count(count: usize, max: usize) -> Result<(), ParseError> {
    if count > max {
        return Err(ParseError::TooManyEntries { count, max });
    }
    if count == 0 {
        return Err(ParseError::Empty);
    }
    Ok(())
}

fn join(context: &str, key: &str) -> String {
    if context.is_empty() {
        key.to_string()
    } else {
        format!("{context}.{key}")
    }
}

fn as_entry<'a>(value: &'a Value, context: &str) -> Result<&'a Map<String, Value>, ParseError> {
    value.as_object().ok_or_else(|| ParseError::InvalidField {
        context: if context.is_empty() {
            "$".to_string()
        } else {
            context.to_string()
        },
        message: "expected an object".to_string(),
    })
}

fn string_field(
    obj: &Map<String, Value>,
    key: &str,
    context: &str,
) -> Result<Option<String>, ParseError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::InvalidField {
            context: join(context, key),
            message: "expected a string".to_string(),
        }),
    }
}

fn first_string(
    obj: &Map<String, Value>,
    keys: &[&str],
    context: &str,
) -> Result<Option<String>, ParseError> {
    for key in keys {
        if let Some(value) = string_field(obj, key, context)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn label_map(
    value: Option<&Value>,
    context: &str,
) -> Result<BTreeMap<String, String>, ParseError> {
    let Some(entries) = object_or_empty(value, context)? else {
        return Ok(BTreeMap::new());
    };

    let mut labels = BTreeMap::new();
    for (key, value) in entries {
        let label = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(ParseError::InvalidField {
                    context: format!("{context}.{key}"),
                    message: "label values must be scalars".to_string(),
                })
            }
        };
        labels.insert(key.clone(), label);
    }
    Ok(labels)
}

fn annotation_map(
    value: Option<&Value>,
    context: &str,
) -> Result<BTreeMap<String, AnnotationValue>, ParseError> {
    let Some(entries) = object_or_empty(value, context)? else {
        return Ok(BTreeMap::new());
    };

    let mut annotations = BTreeMap::new();
    for (key, value) in entries {
        let annotation = match value {
            Value::Null => continue,
            Value::String(s) => AnnotationValue::String(s.clone()),
            Value::Bool(b) => AnnotationValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(n) => AnnotationValue::Number(n),
                None => {
                    return Err(ParseError::InvalidField {
                        context: format!("{context}.{key}"),
                        message: "number out of range".to_string(),
                    })
                }
            },
            Value::Array(_) | Value::Object(_) => {
                return Err(ParseError::InvalidField {
                    context: format!("{context}.{key}"),
                    message: "nested annotation values are not supported".to_string(),
                })
            }
        };
        annotations.insert(key.clone(), annotation);
    }
    Ok(annotations)
}

fn object_or_empty<'a>(
    value: Option<&'a Value>,
    context: &str,
) -> Result<Option<&'a Map<String, Value>>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ParseError::InvalidField {
            context: context.to_string(),
            message: "expected an object".to_string(),
        }),
    }
}
