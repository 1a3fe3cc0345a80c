use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::detect::{AnomalyRecord, Decision, DetectError, DetectorConfig, SeriesKey, Severity};
use crate::event::TimeRange;
use crate::window::stats::Welford;

/// Rolling state for one (source, entity, metric) series.
///
/// Each bucket is scored against the trailing window *before* it is added,
/// so an observation never contributes to its own baseline. The window holds
/// at most `capacity` observations and only those from the `capacity` bucket
/// slots preceding the scored one; sparse series lose stale history.
#[derive(Debug, Clone)]
pub struct SeriesDetector {
    key: SeriesKey,
    /// (window start in epoch ms, observed value)
    values: VecDeque<(i64, f64)>,
    capacity: usize,
    last_window: Option<DateTime<Utc>>,
    /// Width of the last scored bucket.
    width_ms: Option<i64>,
}

impl SeriesDetector {
    pub fn new(key: SeriesKey, capacity: usize) -> Self {
        Self {
            key,
            values: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            last_window: None,
            width_ms: None,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last_window(&self) -> Option<DateTime<Utc>> {
        self.last_window
    }

    /// True once no history would survive into a bucket starting at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        match (self.last_window, self.width_ms) {
            (Some(last), Some(width_ms)) => {
                let span_ms =
                    width_ms.saturating_mul(i64::try_from(self.capacity).unwrap_or(i64::MAX));
                now.timestamp_millis().saturating_sub(last.timestamp_millis()) > span_ms
            }
            _ => self.values.is_empty(),
        }
    }

    /// Drop all history; the next bucket may start anywhere.
    pub fn rebaseline(&mut self) {
        self.values.clear();
        self.last_window = None;
    }

    /// Score `observed` for `window`, then fold it into the baseline.
    pub fn observe(
        &mut self,
        window: TimeRange,
        observed: f64,
        config: &DetectorConfig,
    ) -> Result<AnomalyRecord, DetectError> {
        if let Some(last) = self.last_window {
            if window.start <= last {
                return Err(DetectError::OutOfOrder {
                    series: self.key.clone(),
                    last,
                    got: window.start,
                });
            }
        }
        if !observed.is_finite() {
            return Err(DetectError::NonFinite {
                series: self.key.clone(),
                value: observed,
            });
        }

        self.evict_before(window);

        let baseline: Welford = self.values.iter().map(|(_, v)| *v).collect();
        let samples = baseline.count() as usize;
        let mean = baseline.mean();
        let stddev = baseline.std_dev();

        let (score, decision) = match (mean, stddev) {
            (Some(m), Some(sd)) if samples >= config.min_baseline_samples && sd > 0.0 => {
                let z = (observed - m).abs() / sd;
                let decision = if z > config.threshold {
                    Decision::Anomalous
                } else {
                    Decision::Normal
                };
                (Some(z), decision)
            }
            _ => (None, Decision::InsufficientBaseline),
        };

        self.values.push_back((window.start_ms(), observed));
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
        self.last_window = Some(window.start);
        self.width_ms = Some((window.end_ms() - window.start_ms()).max(1));

        Ok(AnomalyRecord {
            series: self.key.clone(),
            window_start: window.start,
            window_end: window.end,
            observed,
            baseline_mean: mean,
            baseline_stddev: stddev,
            baseline_samples: samples,
            score,
            decision,
            severity: Severity::from_score(score.unwrap_or(0.0), config.threshold, decision),
        })
    }

    /// Drop observations older than `capacity` bucket widths before `window`.
    fn evict_before(&mut self, window: TimeRange) {
        let width_ms = (window.end_ms() - window.start_ms()).max(1);
        let span_ms = width_ms.saturating_mul(i64::try_from(self.capacity).unwrap_or(i64::MAX));
        let horizon_ms = window.start_ms().saturating_sub(span_ms);
        while self.values.front().is_some_and(|(start, _)| *start < horizon_ms) {
            self.values.pop_front();
        }
    }
}
