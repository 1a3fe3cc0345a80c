use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::detect::{AnomalyRecord, DetectError, DetectorConfig, SeriesDetector, SeriesKey};
use crate::event::TimeRange;
use crate::window::Bucket;

/// Result of scoring a batch of buckets.
#[derive(Debug, Default)]
pub struct EvaluationReport {
    /// Ordered by window start, then entity.
    pub records: Vec<AnomalyRecord>,
    pub rejected: Vec<DetectError>,
}

impl EvaluationReport {
    pub fn anomalies(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.records.iter().filter(|r| r.is_anomalous())
    }
}

/// Owns every series' detector state.
///
/// One mutex per series keeps same-series observations serialized while
/// different series are scored in parallel.
pub struct DetectorRegistry {
    config: DetectorConfig,
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<SeriesDetector>>>>,
}

impl DetectorRegistry {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.series.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn detector(&self, key: &SeriesKey) -> Arc<Mutex<SeriesDetector>> {
        if let Some(d) = self
            .series
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
        {
            return Arc::clone(d);
        }
        let mut series = self.series.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(series.entry(key.clone()).or_insert_with(|| {
            debug!(series = %key, "new detector series");
            Arc::new(Mutex::new(SeriesDetector::new(
                key.clone(),
                self.config.baseline_window,
            )))
        }))
    }

    /// Score one observation for `key`.
    pub async fn observe(
        &self,
        key: &SeriesKey,
        window: TimeRange,
        observed: f64,
    ) -> Result<AnomalyRecord, DetectError> {
        let detector = self.detector(key);
        let mut guard = detector.lock().await;
        guard.observe(window, observed, &self.config)
    }

    /// Reset a series. Returns `false` when it did not exist.
    pub async fn rebaseline(&self, key: &SeriesKey) -> bool {
        let existing = self
            .series
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned();
        match existing {
            Some(detector) => {
                detector.lock().await.rebaseline();
                info!(series = %key, "series rebaselined");
                true
            }
            None => false,
        }
    }

    /// Drop series whose whole baseline has aged out by `now`.
    ///
    /// Series being scored are skipped. Returns how many were removed.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let mut series = self.series.write().unwrap_or_else(|p| p.into_inner());
        let before = series.len();
        series.retain(|_, detector| match detector.try_lock() {
            Ok(guard) => !guard.is_idle(now),
            Err(_) => true,
        });
        let pruned = before - series.len();
        if pruned > 0 {
            info!(pruned, remaining = series.len(), "idle detector series pruned");
        }
        pruned
    }

    /// Latest evaluated window start over every series `source` feeds for `metric`.
    pub async fn newest_window(&self, source: &str, metric: &str) -> Option<DateTime<Utc>> {
        let detectors: Vec<_> = self
            .series
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(k, _)| k.source == source && k.metric == metric)
            .map(|(_, d)| Arc::clone(d))
            .collect();
        let mut newest = None;
        for d in detectors {
            newest = newest.max(d.lock().await.last_window());
        }
        newest
    }

    /// Score `metric` on every bucket `source` produced; one task per series.
    ///
    /// Buckets are split into series by group key and fed to each series in
    /// window order. Buckets without a numeric `metric` are skipped.
    pub async fn evaluate_buckets(
        &self,
        buckets: &[Bucket],
        source: &str,
        metric: &str,
    ) -> EvaluationReport {
        let mut by_series: BTreeMap<SeriesKey, Vec<(TimeRange, f64)>> = BTreeMap::new();
        for bucket in buckets {
            match bucket.metric(metric) {
                Some(v) => by_series
                    .entry(SeriesKey::new(source, bucket.group_key.clone(), metric))
                    .or_default()
                    .push((bucket.window(), v)),
                None => debug!(group = %bucket.group_key, metric, "bucket has no value for metric"),
            }
        }

        let mut tasks = JoinSet::new();
        for (key, mut points) in by_series {
            points.sort_by_key(|(w, _)| w.start);
            let detector = self.detector(&key);
            let config = self.config.clone();
            tasks.spawn(async move {
                let mut guard = detector.lock().await;
                points
                    .into_iter()
                    .map(|(window, v)| guard.observe(window, v, &config))
                    .collect::<Vec<_>>()
            });
        }

        let mut report = EvaluationReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(results) => {
                    for r in results {
                        match r {
                            Ok(record) => report.records.push(record),
                            Err(e) => {
                                warn!(error = %e, "observation rejected");
                                report.rejected.push(e);
                            }
                        }
                    }
                }
                Err(e) => error!(error = %e, "detector task failed"),
            }
        }

        report.records.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.series.cmp(&b.series))
        });
        let anomalies = report.anomalies().count();
        info!(
            buckets = buckets.len(),
            records = report.records.len(),
            anomalies,
            "detector evaluation complete"
        );
        report
    }
}
