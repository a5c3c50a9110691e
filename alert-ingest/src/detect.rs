use serde_json::{Map, Value};

/// Minimum confidence for a specific parser to run.
pub const CONFIDENCE_THRESHOLD: f32 = 0.8;

// Scores are kept in whole points so threshold comparisons are exact
const ALERTMANAGER_BASE: u8 = 50;
const GENERIC_BASE: u8 = 50;
const GENERIC_CAP: u8 = 80;
// An alerts array next to a group key or receiver is an Alertmanager envelope
const ALERTMANAGER_ENVELOPE_FLOOR: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    /// Prometheus Alertmanager webhook payload
    Alertmanager,
    /// Loosely shaped alert object, or array of them
    Generic,
    Unknown,
}

impl WebhookFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alertmanager => "alertmanager",
            Self::Generic => "generic",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedFormat {
    pub variant: WebhookFormat,
    pub confidence: f32,
}

impl DetectedFormat {
    pub fn unknown() -> Self {
        Self {
            variant: WebhookFormat::Unknown,
            confidence: 0.0,
        }
    }

    fn scored(variant: WebhookFormat, points: u8) -> Self {
        Self {
            variant,
            confidence: f32::from(points) / 100.0,
        }
    }

    /// True when a format-specific parser may run on the payload.
    pub fn is_confident(&self) -> bool {
        self.variant != WebhookFormat::Unknown && self.confidence >= CONFIDENCE_THRESHOLD
    }
}

/// Classify a raw body. Never fails: anything that is not a JSON object or an
/// array of objects is `Unknown` with zero confidence.
pub fn detect(body: &[u8]) -> DetectedFormat {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return DetectedFormat::unknown();
    };

    let alertmanager = alertmanager_points(&value);
    let generic = generic_points(&value);

    if alertmanager == 0 && generic == 0 {
        DetectedFormat::unknown()
    } else if alertmanager >= generic {
        DetectedFormat::scored(WebhookFormat::Alertmanager, alertmanager)
    } else {
        DetectedFormat::scored(WebhookFormat::Generic, generic)
    }
}

fn alertmanager_points(value: &Value) -> u8 {
    let Some(root) = value.as_object() else {
        return 0;
    };
    let has_alert_objects = root
        .get("alerts")
        .and_then(Value::as_array)
        .is_some_and(|alerts| alerts.iter().all(Value::is_object));
    if !has_alert_objects {
        return 0;
    }

    let mut points = ALERTMANAGER_BASE;
    let has_group_key = root.contains_key("groupKey");
    let has_receiver = root.contains_key("receiver");
    if has_group_key {
        points += 20;
    }
    if has_receiver {
        points += 10;
    }
    if ["version", "groupLabels", "commonLabels"]
        .iter()
        .any(|key| root.contains_key(*key))
    {
        points += 10;
    }
    if root.get("status").is_some_and(Value::is_string) {
        points += 10;
    }
    if has_group_key || has_receiver {
        points = points.max(ALERTMANAGER_ENVELOPE_FLOOR);
    }
    points
}

fn generic_points(value: &Value) -> u8 {
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(root) => match root.get("alerts").and_then(Value::as_array) {
            Some(alerts) => alerts.iter().collect(),
            None => vec![value],
        },
        _ => return 0,
    };
    if !entries.iter().all(|entry| entry.is_object()) {
        return 0;
    }

    let mut points = GENERIC_BASE;
    if let Some(first) = entries.first().and_then(|entry| entry.as_object()) {
        if names_alert(first) {
            points += 20;
        }
        if [
            "status",
            "state",
            "labels",
            "annotations",
            "severity",
            "message",
            "startsAt",
        ]
        .iter()
        .any(|key| first.contains_key(*key))
        {
            points += 10;
        }
    }
    points.min(GENERIC_CAP)
}

fn names_alert(entry: &Map<String, Value>) -> bool {
    ["alertname", "name", "title"]
        .iter()
        .any(|key| entry.contains_key(*key))
        || entry
            .get("labels")
            .and_then(Value::as_object)
            .is_some_and(|labels| labels.contains_key("alertname"))
}
