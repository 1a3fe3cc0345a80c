//! Structured log events and time ranges.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};

/// Severity level carried by every log record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Level {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Critical => "Critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "information" | "informational" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" | "fatal" => Ok(Level::Critical),
            other => Err(EngineError::validation(format!("unknown level '{other}'"))),
        }
    }
}

/// An event as pushed by an external collector, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl EventInput {
    pub fn new(entity: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            entity: entity.into(),
            category: String::new(),
            level: Level::Info,
            message: String::new(),
            resource_id: String::new(),
            properties: Map::new(),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check the event shape and size limit, producing an unsequenced [`Event`].
    pub fn validate(self, max_bytes: usize) -> EngineResult<Event> {
        let timestamp = self
            .timestamp
            .ok_or_else(|| EngineError::validation("event timestamp is missing"))?;
        if self.entity.trim().is_empty() {
            return Err(EngineError::validation("event entity name is empty"));
        }

        let size = serde_json::to_vec(&self)?.len();
        if size > max_bytes {
            return Err(EngineError::validation(format!(
                "event is {size} bytes, limit is {max_bytes}"
            )));
        }

        Ok(Event {
            id: 0,
            timestamp,
            entity: self.entity,
            category: self.category,
            level: self.level,
            message: self.message,
            resource_id: self.resource_id,
            properties: self.properties,
        })
    }
}

/// A stored, immutable log record. `id` is the store's ingestion sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub entity: String,
    pub category: String,
    pub level: Level,
    pub message: String,
    pub resource_id: String,
    pub properties: Map<String, Value>,
}

impl Event {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> EngineResult<Self> {
        let range = Self { start, end };
        range.check()?;
        Ok(range)
    }

    /// The trailing `lookback` ending at `end`.
    pub fn trailing(end: DateTime<Utc>, lookback: chrono::Duration) -> EngineResult<Self> {
        Self::new(end - lookback, end)
    }

    /// Ranges can arrive through deserialization, so operations re-check them.
    pub fn check(&self) -> EngineResult<()> {
        if self.end <= self.start {
            return Err(EngineError::InvalidRange {
                start: self.start.to_rfc3339(),
                end: self.end.to_rfc3339(),
            });
        }
        Ok(())
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn contains_ms(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms() && ts_ms < self.end_ms()
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Floor `ts_ms` to a multiple of `size_ms` counted from the Unix epoch.
pub fn align_down(ts_ms: i64, size_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(size_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_missing_timestamp_is_rejected() {
        let mut input = EventInput::new("F1", Utc::now());
        input.timestamp = None;
        let err = input.validate(1024).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_oversized_event_is_rejected() {
        let input = EventInput::new("F1", Utc::now()).with_message("x".repeat(2048));
        assert!(matches!(
            input.validate(1024),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_range_must_be_non_empty() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            TimeRange::new(t, t),
            Err(EngineError::InvalidRange { .. })
        ));
        let r = TimeRange::new(t, t + chrono::Duration::seconds(1)).unwrap();
        assert!(r.contains(t));
        assert!(!r.contains(r.end));
    }

    #[test]
    fn test_align_down_handles_pre_epoch() {
        assert_eq!(align_down(1_234, 1_000), 1_000);
        assert_eq!(align_down(-1, 1_000), -1_000);
        assert_eq!(align_down(3_000, 1_000), 3_000);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("Critical".parse::<Level>().unwrap(), Level::Critical);
        assert!("loud".parse::<Level>().is_err());
    }
}
