//! Online anomaly detection over windowed series.

pub mod baseline;
pub mod engine;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DetectionConfig;

pub use self::baseline::SeriesDetector;
pub use self::engine::{DetectorRegistry, EvaluationReport};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("bucket {got} for series {series} is not after the last evaluated bucket {last}; rebaseline first")]
    OutOfOrder {
        series: SeriesKey,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("non-finite observation {value} for series {series}")]
    NonFinite { series: SeriesKey, value: f64 },
}

/// Severity levels for anomalies and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Critical => "Critical",
        }
    }

    /// Bands relative to the detector threshold.
    pub fn from_score(score: f64, threshold: f64, decision: Decision) -> Self {
        if decision != Decision::Anomalous {
            Severity::Info
        } else if score > 3.0 * threshold {
            Severity::Critical
        } else if score > 2.0 * threshold {
            Severity::Error
        } else {
            Severity::Warning
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Normal,
    Anomalous,
    InsufficientBaseline,
}

/// Identity of one detector series.
///
/// `source` names what produced the buckets (a detection job, or a pipeline
/// fingerprint for ad-hoc runs) so different pipelines scoring the same
/// metric keep separate baselines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub source: String,
    pub entity: String,
    pub metric: String,
}

impl SeriesKey {
    pub fn new(
        source: impl Into<String>,
        entity: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            entity: entity.into(),
            metric: metric.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.source, self.entity, self.metric)
    }
}

/// Outcome of scoring one bucket against its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub series: SeriesKey,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub observed: f64,
    pub baseline_mean: Option<f64>,
    pub baseline_stddev: Option<f64>,
    pub baseline_samples: usize,
    /// `|observed - mean| / stddev`, absent without a usable baseline.
    pub score: Option<f64>,
    pub decision: Decision,
    pub severity: Severity,
}

impl AnomalyRecord {
    pub fn is_anomalous(&self) -> bool {
        self.decision == Decision::Anomalous
    }
}

/// Scoring knobs shared by every series.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub threshold: f64,
    pub min_baseline_samples: usize,
    /// Trailing bucket slots (and at most that many observations) per series.
    pub baseline_window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        (&DetectionConfig::default()).into()
    }
}

impl From<&DetectionConfig> for DetectorConfig {
    fn from(cfg: &DetectionConfig) -> Self {
        Self {
            threshold: cfg.anomaly_threshold,
            min_baseline_samples: cfg.min_baseline_samples.max(1),
            baseline_window: cfg.baseline_window().max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bands() {
        let t = 2.0;
        assert_eq!(Severity::from_score(9.9, t, Decision::Anomalous), Severity::Critical);
        assert_eq!(Severity::from_score(5.0, t, Decision::Anomalous), Severity::Error);
        assert_eq!(Severity::from_score(2.5, t, Decision::Anomalous), Severity::Warning);
        assert_eq!(Severity::from_score(1.0, t, Decision::Normal), Severity::Info);
        assert!(Severity::Critical > Severity::Warning);
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
    }
}
