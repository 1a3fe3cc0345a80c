//! Alert rules, fired alert events, and their delivery.

pub mod dispatcher;
pub mod history;
pub mod sink;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::duration_str;
use crate::detect::{AnomalyRecord, Severity};
use crate::window::Bucket;

pub use self::dispatcher::AlertDispatcher;
pub use self::history::AlertHistory;
pub use self::sink::{AlertSink, ChannelConfig, ChannelKind};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("rule '{rule}' is malformed: {reason}")]
    Rule { rule: String, reason: String },

    #[error("no sink registered for channel '{0}'")]
    UnknownChannel(String),

    #[error("delivery to '{channel}' failed: {reason}")]
    Delivery { channel: String, reason: String },
}

/// Condition a rule tests against its subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePredicate {
    /// The detector flagged the bucket.
    Anomalous,
    /// Anomaly score strictly above `threshold`.
    ScoreAbove { threshold: f64 },
    MetricAbove { metric: String, threshold: f64 },
    MetricBelow { metric: String, threshold: f64 },
}

fn default_cooldown() -> Duration {
    Duration::from_secs(15 * 60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub predicate: RulePredicate,
    /// Regex an entity must match for the rule to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_pattern: Option<String>,
    #[serde(with = "duration_str", default = "default_cooldown")]
    pub cooldown: Duration,
    pub channel: String,
    /// Fixed severity; otherwise taken from the anomaly record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        predicate: RulePredicate,
        channel: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            predicate,
            entity_pattern: None,
            cooldown,
            channel: channel.into(),
            severity: None,
        }
    }

    pub fn with_entity_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.entity_pattern = Some(pattern.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum AlertSubject<'a> {
    Anomaly(&'a AnomalyRecord),
    Aggregate(&'a Bucket),
}

impl AlertSubject<'_> {
    pub fn entity(&self) -> &str {
        match self {
            AlertSubject::Anomaly(r) => &r.series.entity,
            AlertSubject::Aggregate(b) => &b.group_key,
        }
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        match self {
            AlertSubject::Anomaly(r) => r.window_start,
            AlertSubject::Aggregate(b) => b.window_start,
        }
    }

    /// Anomaly records answer `observed`, `score` and their own metric name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match self {
            AlertSubject::Anomaly(r) => match name {
                "score" => r.score,
                "observed" => Some(r.observed),
                n if n == r.series.metric => Some(r.observed),
                _ => None,
            },
            AlertSubject::Aggregate(b) => b.metric(name),
        }
    }
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: String,
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub message: String,
    pub severity: Severity,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_from_toml() {
        let rule: AlertRule = toml::from_str(
            r#"
id = "slow-checkout"
name = "Slow checkout"
channel = "ops"
entity_pattern = "^checkout"
predicate = { kind = "metric_above", metric = "p95_latency", threshold = 800.0 }
"#,
        )
        .unwrap();
        assert_eq!(rule.cooldown, default_cooldown());
        assert_eq!(rule.severity, None);
        assert_eq!(
            rule.predicate,
            RulePredicate::MetricAbove {
                metric: "p95_latency".into(),
                threshold: 800.0
            }
        );
    }
}
