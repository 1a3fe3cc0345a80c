//! Execution history tracking for detection job runs.

/// A record of one detection job execution.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub job_name: String,
    pub status: RunStatus,
    pub anomalies: usize,
    pub alerts: usize,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunStatus {
    Success,
    Failed,
    TimedOut,
}
