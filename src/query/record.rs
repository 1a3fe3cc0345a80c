//! Rows flowing through a pipeline and the field vocabulary they expose.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::event::Event;

/// Output row: field name to value.
pub type Row = Map<String, Value>;

/// Built-in event fields, always in scope before a projection.
pub const BUILTIN_FIELDS: &[&str] = &[
    "id",
    "timestamp",
    "entity",
    "category",
    "level",
    "message",
    "resource_id",
];

/// Prefix addressing the free-form property map.
pub const PROPERTIES_PREFIX: &str = "properties.";

/// Anything a predicate or sort key can read fields from.
pub trait Fields {
    /// `Value::Null` for a field with no value on this row.
    fn field(&self, name: &str) -> Value;

    fn timestamp_ms(&self) -> Option<i64> {
        None
    }
}

/// Fixed-width RFC 3339 so timestamp strings sort chronologically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One event as seen by the pipeline, plus fields added by `extract`.
#[derive(Debug, Clone)]
pub struct Record {
    event: Arc<Event>,
    extracted: BTreeMap<String, Value>,
    projection: Option<Arc<[String]>>,
}

impl Record {
    pub fn new(event: Arc<Event>) -> Self {
        Self {
            event,
            extracted: BTreeMap::new(),
            projection: None,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.extracted.insert(field.to_string(), value);
    }

    pub fn project(&mut self, fields: Arc<[String]>) {
        self.projection = Some(fields);
    }

    /// Materialize the row, honoring the last projection.
    pub fn into_row(self) -> Row {
        let mut row = Map::new();
        match &self.projection {
            Some(fields) => {
                for f in fields.iter() {
                    row.insert(f.clone(), self.field(f));
                }
            }
            None => {
                for f in BUILTIN_FIELDS {
                    row.insert((*f).to_string(), self.field(f));
                }
                row.insert(
                    "properties".to_string(),
                    Value::Object(self.event.properties.clone()),
                );
                for (k, v) in &self.extracted {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        row
    }
}

impl Fields for Record {
    fn field(&self, name: &str) -> Value {
        let e = &self.event;
        match name {
            "id" => Value::from(e.id),
            "timestamp" => Value::String(format_timestamp(&e.timestamp)),
            "entity" => Value::String(e.entity.clone()),
            "category" => Value::String(e.category.clone()),
            "level" => Value::String(e.level.as_str().to_string()),
            "message" => Value::String(e.message.clone()),
            "resource_id" => Value::String(e.resource_id.clone()),
            _ => {
                if let Some(v) = self.extracted.get(name) {
                    return v.clone();
                }
                name.strip_prefix(PROPERTIES_PREFIX)
                    .and_then(|key| e.properties.get(key))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
        }
    }

    fn timestamp_ms(&self) -> Option<i64> {
        Some(self.event.timestamp_ms())
    }
}

impl Fields for Row {
    fn field(&self, name: &str) -> Value {
        if let Some(v) = self.get(name) {
            return v.clone();
        }
        name.strip_prefix(PROPERTIES_PREFIX)
            .and_then(|key| self.get("properties").and_then(|p| p.get(key)))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Value semantics
// ---------------------------------------------------------------------------

/// Numbers, and strings that parse as numbers.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Numeric when both sides are numeric, lexicographic for strings, `None` otherwise.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => match (x.parse::<f64>(), y.parse::<f64>()) {
            (Ok(p), Ok(q)) => p.partial_cmp(&q),
            _ => Some(x.cmp(y)),
        },
        (Value::Null, _) | (_, Value::Null) => None,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => compare_values(a, b) == Some(Ordering::Equal) || a == b,
    }
}

/// Plain text for strings, JSON for everything else; empty for null.
pub fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `f64` to JSON, with non-finite values as null.
pub fn number_value(x: f64) -> Value {
    serde_json::Number::from_f64(x)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventInput;
    use serde_json::json;

    fn record() -> Record {
        let event = EventInput::new("F1", Utc::now())
            .with_message("GET /api 200 in 35ms")
            .with_property("duration_ms", 35)
            .validate(4096)
            .unwrap();
        Record::new(Arc::new(event))
    }

    #[test]
    fn test_builtin_and_property_fields() {
        let mut rec = record();
        assert_eq!(rec.field("entity"), json!("F1"));
        assert_eq!(rec.field("level"), json!("Info"));
        assert_eq!(rec.field("properties.duration_ms"), json!(35));
        assert_eq!(rec.field("properties.missing"), Value::Null);

        rec.set("status", json!("200"));
        assert_eq!(rec.field("status"), json!("200"));

        rec.project(Arc::from(vec!["entity".to_string(), "status".to_string()]));
        let row = rec.into_row();
        assert_eq!(row.len(), 2);
        assert_eq!(row["status"], json!("200"));
    }

    #[test]
    fn test_value_comparison() {
        assert_eq!(compare_values(&json!(2), &json!("10")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!(null), &json!(1)), None);
        assert!(values_equal(&json!(35), &json!(35.0)));
        assert!(!values_equal(&json!(null), &json!("")));
    }
}
