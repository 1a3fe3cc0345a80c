//! Error taxonomy shared by ingestion and query execution.

use thiserror::Error;

/// Errors surfaced synchronously to ingestion and query callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input event or pipeline descriptor.
    #[error("validation error: {0}")]
    Validation(String),

    /// A time range whose end is not after its start.
    #[error("invalid time range: end {end} is not after start {start}")]
    InvalidRange { start: String, end: String },

    /// A pipeline stage references an undefined field or is misplaced.
    #[error("pipeline error at stage {stage}: {reason}")]
    Pipeline { stage: usize, reason: String },

    /// The caller-supplied deadline expired.
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Journal or connection pool failure.
    #[error("storage error: {message}")]
    Storage { message: String, transient: bool },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn pipeline(stage: usize, reason: impl Into<String>) -> Self {
        Self::Pipeline {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether the ingestion boundary may retry this failure before acknowledging.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { transient: true, .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        let transient = matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );
        Self::Storage {
            message: e.to_string(),
            transient,
        }
    }
}

impl From<r2d2::Error> for EngineError {
    fn from(e: r2d2::Error) -> Self {
        // Pool checkout only fails on timeout waiting for a free connection.
        Self::Storage {
            message: e.to_string(),
            transient: true,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(EngineError::from(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!EngineError::from(constraint).is_transient());
        assert!(!EngineError::validation("bad").is_transient());
    }
}
