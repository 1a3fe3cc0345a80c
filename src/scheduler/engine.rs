use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertDispatcher, AlertEvent, AlertSubject};
use crate::detect::{AnomalyRecord, DetectorRegistry};
use crate::error::{EngineError, EngineResult};
use crate::event::{align_down, TimeRange};
use crate::query::{Pipeline, QueryEngine, QueryOptions};
use crate::scheduler::history::{HistoryEntry, RunStatus};
use crate::scheduler::{DetectionJob, Scheduler};

/// What one detection pass produced.
#[derive(Debug, Default, Serialize)]
pub struct DetectionOutcome {
    pub records: Vec<AnomalyRecord>,
    pub rejected: Vec<String>,
    pub alerts: Vec<AlertEvent>,
}

impl DetectionOutcome {
    pub fn anomalies(&self) -> usize {
        self.records.iter().filter(|r| r.is_anomalous()).count()
    }
}

/// Query → detector → dispatcher, shared by the scheduler and the API.
#[derive(Clone)]
pub struct DetectionRunner {
    pub engine: QueryEngine,
    pub registry: Arc<DetectorRegistry>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub query_timeout: Duration,
}

impl DetectionRunner {
    /// Summarize `range`, score `metric` per group, and dispatch fired alerts.
    ///
    /// `source` names the baseline family: a job name, or
    /// [`DetectionRunner::adhoc_source`] for one-off runs.
    pub async fn run(
        &self,
        pipeline: Pipeline,
        range: TimeRange,
        source: &str,
        metric: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DetectionOutcome> {
        if !pipeline.is_summarizing() {
            return Err(EngineError::validation(
                "detection needs a pipeline with a summarize stage",
            ));
        }
        let output = self
            .engine
            .run(pipeline, range, QueryOptions::with_timeout(self.query_timeout))
            .await?;
        let buckets = output.buckets().unwrap_or_default();

        let report = self.registry.evaluate_buckets(buckets, source, metric).await;

        let mut alerts = Vec::new();
        for record in &report.records {
            alerts.extend(self.dispatcher.evaluate(&AlertSubject::Anomaly(record), now));
        }
        for bucket in buckets {
            alerts.extend(self.dispatcher.evaluate(&AlertSubject::Aggregate(bucket), now));
        }
        self.dispatcher.dispatch(&alerts).await;

        Ok(DetectionOutcome {
            records: report.records,
            rejected: report.rejected.iter().map(|e| e.to_string()).collect(),
            alerts,
        })
    }

    /// Series source for a pipeline run outside any configured job.
    pub fn adhoc_source(pipeline: &Pipeline) -> String {
        format!("adhoc-{:016x}", pipeline.fingerprint())
    }

    /// Drop detector series and alert cooldowns that can no longer matter.
    pub fn prune(&self, now: DateTime<Utc>) {
        let series = self.registry.prune_idle(now);
        let cooldowns = self.dispatcher.prune_cooldowns(now);
        debug!(series, cooldowns, "detection state pruned");
    }

    /// Only complete buckets: the range ends at the last bucket boundary.
    pub fn job_range(job: &DetectionJob, default_bucket: Duration, now: DateTime<Utc>) -> EngineResult<TimeRange> {
        let bucket_ms = job
            .pipeline
            .bucket_size()
            .unwrap_or(default_bucket)
            .as_millis()
            .max(1) as i64;
        let end_ms = align_down(now.timestamp_millis(), bucket_ms);
        let end = DateTime::<Utc>::from_timestamp_millis(end_ms)
            .ok_or_else(|| EngineError::validation("detection window out of range"))?;
        let lookback = chrono::Duration::from_std(job.lookback)
            .map_err(|e| EngineError::validation(format!("lookback: {e}")))?;
        TimeRange::trailing(end, lookback)
    }
}

/// Main scheduler execution loop.
/// Polls for due detection jobs every 10 seconds until `shutdown` fires.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    runner: DetectionRunner,
    default_bucket: Duration,
    shutdown: CancellationToken,
) {
    info!(jobs = scheduler.jobs().len(), "Scheduler engine started");

    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduler engine stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        let now = Utc::now();
        for job in scheduler.check_due_tasks(now) {
            info!(job = %job.name, "Detection job due");

            let scheduler = scheduler.clone();
            let runner = runner.clone();

            tokio::spawn(async move {
                let entry = run_job(&runner, &job, default_bucket, now).await;
                scheduler.record_run(entry);
            });
        }
    }
}

async fn run_job(
    runner: &DetectionRunner,
    job: &DetectionJob,
    default_bucket: Duration,
    now: DateTime<Utc>,
) -> HistoryEntry {
    let started_at = Utc::now();
    let result = match DetectionRunner::job_range(job, default_bucket, now) {
        Ok(range) => {
            match fresh_range(runner, job, range).await {
                Some(range) => {
                    runner
                        .run(job.pipeline.clone(), range, &job.name, &job.metric, now)
                        .await
                }
                None => Ok(DetectionOutcome::default()),
            }
        }
        Err(e) => Err(e),
    };

    let (status, anomalies, alerts, error) = match result {
        Ok(outcome) => {
            info!(
                job = %job.name,
                anomalies = outcome.anomalies(),
                alerts = outcome.alerts.len(),
                "Detection job finished"
            );
            (RunStatus::Success, outcome.anomalies(), outcome.alerts.len(), None)
        }
        Err(e @ EngineError::Timeout { .. }) => {
            warn!(job = %job.name, error = %e, "Detection job timed out");
            (RunStatus::TimedOut, 0, 0, Some(e.to_string()))
        }
        Err(e) => {
            error!(job = %job.name, error = %e, "Detection job failed");
            (RunStatus::Failed, 0, 0, Some(e.to_string()))
        }
    };

    HistoryEntry {
        job_name: job.name.clone(),
        status,
        anomalies,
        alerts,
        error,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Successive runs overlap their lookback; start after the newest bucket the
/// detector already holds for this job so series never see a bucket twice.
/// `None` when every bucket in `range` was already scored.
async fn fresh_range(
    runner: &DetectionRunner,
    job: &DetectionJob,
    range: TimeRange,
) -> Option<TimeRange> {
    let newest = runner
        .registry
        .newest_window(&job.name, &job.metric)
        .await
        .filter(|t| *t >= range.start);
    match newest {
        Some(last) => {
            let bucket = job
                .pipeline
                .bucket_size()
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .unwrap_or_else(|| range.end - range.start);
            let start = last + bucket;
            (start < range.end).then_some(TimeRange {
                start,
                end: range.end,
            })
        }
        None => Some(range),
    }
}
