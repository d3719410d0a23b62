//! Confidence score normalization.
//!
//! Analysis backends report per-class confidence in several shapes:
//!
//! * a list of `[label, value]` pairs,
//! * a list of objects whose label and value live under varying key names,
//! * a flat `{label: value}` mapping,
//! * any of the above, JSON-encoded inside a string.
//!
//! Every shape is classified into a [`ScoreItem`] first and only then turned
//! into [`ConfidenceEntry`] values, so the fallback order is explicit.

use serde_json::{Map, Value};

/// Keys tried, in order, for the label of an object entry.
const LABEL_KEYS: [&str; 6] = ["label", "name", "class", "key", "category", "type"];

/// Keys tried, in order, for the value of an object entry.
const VALUE_KEYS: [&str; 7] = [
    "percentage",
    "percent",
    "confidence",
    "probability",
    "prob",
    "score",
    "value",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceEntry {
    pub label: String,
    pub percentage: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceBreakdown {
    pub entries: Vec<ConfidenceEntry>,
    /// Index into `entries` of the class the result was reported as.
    pub predicted: Option<usize>,
}

impl ConfidenceBreakdown {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_predicted(&self, index: usize) -> bool {
        self.predicted == Some(index)
    }

    pub fn predicted_entry(&self) -> Option<&ConfidenceEntry> {
        self.predicted.and_then(|index| self.entries.get(index))
    }
}

enum ScoreItem<'a> {
    Pair(&'a [Value]),
    Record(&'a Map<String, Value>),
    Field(&'a str, &'a Value),
}

/// Normalizes a raw payload into entries sorted by descending percentage.
///
/// Ties keep their input order.
pub fn normalize(payload: &Value) -> Vec<ConfidenceEntry> {
    let mut entries = Vec::new();
    for item in classify(payload) {
        push_item(&mut entries, item);
    }
    entries.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));
    entries
}

/// Normalizes a payload and marks the entry matching `detected_case`, or the
/// top entry when nothing matches.
pub fn breakdown(payload: &Value, detected_case: Option<&str>) -> ConfidenceBreakdown {
    let entries = normalize(payload);
    let matched = detected_case.and_then(|case| {
        entries
            .iter()
            .position(|entry| labels_match(&entry.label, case))
    });
    let predicted = matched.or(if entries.is_empty() { None } else { Some(0) });
    ConfidenceBreakdown { entries, predicted }
}

pub fn labels_match(left: &str, right: &str) -> bool {
    let left = comparable_label(left);
    !left.is_empty() && left == comparable_label(right)
}

fn comparable_label(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Coerces a JSON score into a 0-100 percentage.
///
/// Numbers at or below 1 are fractions; strings may carry a trailing `%`, in
/// which case the number is already a percentage. Anything unusable is 0.
pub fn coerce_percentage(value: &Value) -> f32 {
    match value {
        Value::Number(number) => number.as_f64().map(percentage_from_number).unwrap_or(0.0),
        Value::String(text) => percentage_from_text(text),
        _ => 0.0,
    }
}

pub fn percentage_from_number(value: f64) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    let percent = if value <= 1.0 { value * 100.0 } else { value };
    round_percentage(percent)
}

fn percentage_from_text(text: &str) -> f32 {
    let trimmed = text.trim();
    if let Some(number) = trimmed.strip_suffix('%') {
        return match number.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => round_percentage(value),
            _ => 0.0,
        };
    }
    trimmed
        .parse::<f64>()
        .map(percentage_from_number)
        .unwrap_or(0.0)
}

fn round_percentage(value: f64) -> f32 {
    let clamped = value.clamp(0.0, 100.0);
    ((clamped * 100.0).round() / 100.0) as f32
}

fn classify(payload: &Value) -> Vec<ScoreItem<'_>> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Array(pair) => Some(ScoreItem::Pair(pair.as_slice())),
                Value::Object(record) => Some(ScoreItem::Record(record)),
                other => {
                    log::debug!("Skipping confidence item with unsupported shape: {other}");
                    None
                }
            })
            .collect(),
        Value::Object(mapping) => mapping
            .iter()
            .map(|(label, value)| ScoreItem::Field(label.as_str(), value))
            .collect(),
        _ => Vec::new(),
    }
}

fn push_item(entries: &mut Vec<ConfidenceEntry>, item: ScoreItem<'_>) {
    match item {
        ScoreItem::Pair(pair) => {
            let Some(label) = pair.first().and_then(label_text) else {
                return;
            };
            let percentage = pair.get(1).map(coerce_percentage).unwrap_or(0.0);
            entries.push(ConfidenceEntry { label, percentage });
        }
        ScoreItem::Record(record) => {
            let label = LABEL_KEYS
                .iter()
                .find_map(|key| record.get(*key).and_then(label_text));
            match label {
                Some(label) => {
                    let percentage = VALUE_KEYS
                        .iter()
                        .find_map(|key| record.get(*key))
                        .map(coerce_percentage)
                        .unwrap_or(0.0);
                    entries.push(ConfidenceEntry { label, percentage });
                }
                None => {
                    for (label, value) in record {
                        entries.push(ConfidenceEntry {
                            label: label.clone(),
                            percentage: coerce_percentage(value),
                        });
                    }
                }
            }
        }
        ScoreItem::Field(label, value) => entries.push(ConfidenceEntry {
            label: label.to_string(),
            percentage: coerce_percentage(value),
        }),
    }
}

fn label_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Some backends send the score payload JSON-encoded inside a string.
pub fn decode_embedded(payload: Value) -> Value {
    match payload {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(decoded @ (Value::Array(_) | Value::Object(_))) => decoded,
            _ => Value::String(text),
        },
        other => other,
    }
}
