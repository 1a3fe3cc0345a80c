use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};

use crate::config::duration_str;
use crate::query::Pipeline;
use crate::scheduler::history::HistoryEntry;

/// Job runs kept for `recent_runs`.
const HISTORY_LIMIT: usize = 100;

/// A `[[detections]]` entry: summarize the trailing `lookback` on a cron
/// schedule and score `metric` per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub name: String,
    /// Seconds-first cron expression, e.g. `"0 */5 * * * *"`.
    pub cron: String,
    pub pipeline: Pipeline,
    pub metric: String,
    #[serde(with = "duration_str")]
    pub lookback: Duration,
}

impl DetectionJob {
    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::from_str(&self.cron)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", self.cron, e))
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule()?;
        if !self.pipeline.is_summarizing() {
            bail!("pipeline must contain a summarize stage");
        }
        self.pipeline
            .compile()
            .context("pipeline does not compile")?;
        if self.lookback.is_zero() {
            bail!("lookback must be positive");
        }
        Ok(())
    }
}

struct Entry {
    job: DetectionJob,
    schedule: CronSchedule,
    next_run: Option<DateTime<Utc>>,
}

/// Tracks when each configured detection job is next due.
#[derive(Clone)]
pub struct Scheduler {
    entries: Arc<Mutex<Vec<Entry>>>,
    history: Arc<Mutex<VecDeque<HistoryEntry>>>,
}

impl Scheduler {
    /// Jobs whose cron expression does not parse are rejected.
    pub fn new(jobs: Vec<DetectionJob>, now: DateTime<Utc>) -> Result<Self> {
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let schedule = job
                .schedule()
                .with_context(|| format!("detection job '{}'", job.name))?;
            let next_run = schedule.after(&now).next();
            entries.push(Entry {
                job,
                schedule,
                next_run,
            });
        }
        Ok(Self {
            entries: Arc::new(Mutex::new(entries)),
            history: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn jobs(&self) -> Vec<DetectionJob> {
        self.lock_entries().iter().map(|e| e.job.clone()).collect()
    }

    /// Jobs due at `now`; each is advanced to its next slot before returning
    /// so a slow run is never picked up twice.
    pub fn check_due_tasks(&self, now: DateTime<Utc>) -> Vec<DetectionJob> {
        let mut due = Vec::new();
        for entry in self.lock_entries().iter_mut() {
            if entry.next_run.is_some_and(|t| t <= now) {
                due.push(entry.job.clone());
                entry.next_run = entry.schedule.after(&now).next();
            }
        }
        due
    }

    /// Upcoming runs within `hours`, earliest first.
    pub fn preview_next_runs(&self, now: DateTime<Utc>, hours: u64) -> Vec<(DateTime<Utc>, String)> {
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();
        for entry in self.lock_entries().iter() {
            for next_time in entry.schedule.after(&now) {
                if next_time > end {
                    break;
                }
                preview.push((next_time, entry.job.name.clone()));
            }
        }
        preview.sort();
        preview
    }

    pub fn record_run(&self, entry: HistoryEntry) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_front(entry);
        history.truncate(HISTORY_LIMIT);
    }

    /// Most recent first.
    pub fn recent_runs(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Next due time per job.
    pub fn next_runs(&self) -> HashMap<String, Option<DateTime<Utc>>> {
        self.lock_entries()
            .iter()
            .map(|e| (e.job.name.clone(), e.next_run))
            .collect()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
