//! Ingestion boundary: bounded, retrying appends on behalf of collectors.
//!
//! This is the only place that retries storage failures, and only transient
//! journal failures (SQLite busy/locked, pool checkout) before the event is
//! acknowledged. Everything else is returned to the collector unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::event::EventInput;
use crate::storage::EventStore;

#[derive(Clone)]
pub struct Ingestor {
    store: EventStore,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Ingestor {
    pub fn new(store: EventStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            base_backoff: Duration::from_millis(20),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Append one event, bounded by `timeout`.
    ///
    /// A timeout does not roll back an append already running on the
    /// blocking pool; collectors treat ingestion as at-least-once.
    pub async fn submit(&self, input: EventInput, timeout: Duration) -> EngineResult<u64> {
        bounded(timeout, self.append_with_retry(input)).await
    }

    /// Append a batch under one overall deadline, one result per input.
    pub async fn submit_batch(
        &self,
        inputs: Vec<EventInput>,
        timeout: Duration,
    ) -> Vec<EngineResult<u64>> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                results.push(Err(EngineError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                }));
                continue;
            }
            results.push(self.submit(input, remaining).await);
        }
        results
    }

    async fn append_with_retry(&self, input: EventInput) -> EngineResult<u64> {
        self.retry_transient(|| {
            let store = self.store.clone();
            let event = input.clone();
            async move {
                tokio::task::spawn_blocking(move || store.append(event))
                    .await
                    .map_err(|e| EngineError::Storage {
                        message: format!("append task failed: {e}"),
                        transient: false,
                    })
                    .and_then(|appended| appended)
            }
        })
        .await
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    async fn retry_transient<T, F, Fut>(&self, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying transient append failure");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1));
        let jitter = rand::thread_rng().gen_range(0..=self.base_backoff.as_millis() as u64);
        exp + Duration::from_millis(jitter)
    }
}

async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            warn!(elapsed_ms, "event append timed out");
            Err(EngineError::Timeout { elapsed_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TimeRange;
    use crate::storage::{EventFilter, StoreOptions};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> EngineError {
        EngineError::Storage {
            message: "database is locked".into(),
            transient: true,
        }
    }

    fn quick(max_attempts: u32) -> Ingestor {
        let mut ingestor = Ingestor::new(EventStore::in_memory(StoreOptions::default()), max_attempts);
        ingestor.base_backoff = Duration::from_millis(1);
        ingestor
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_success() {
        let ingestor = quick(3);
        let calls = AtomicU32::new(0);
        let result = ingestor
            .retry_transient(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 3 { Err(busy()) } else { Ok(n) } }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_surfaces_after_last_attempt() {
        let ingestor = quick(2);
        let calls = AtomicU32::new(0);
        let result: EngineResult<u64> = ingestor
            .retry_transient(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(busy()) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_storage_failure_is_not_retried() {
        let ingestor = quick(5);
        let calls = AtomicU32::new(0);
        let result: EngineResult<u64> = ingestor
            .retry_transient(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EngineError::Storage {
                        message: "disk I/O error".into(),
                        transient: false,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Storage { transient: false, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_append_times_out() {
        let result: EngineResult<u64> = bounded(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        })
        .await;
        match result {
            Err(EngineError::Timeout { elapsed_ms }) => assert!(elapsed_ms >= 20),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_batch_deadline_times_out_without_appending() {
        let store = EventStore::in_memory(StoreOptions::default());
        let ingestor = Ingestor::new(store.clone(), 3);
        let now = Utc::now();
        let results = ingestor
            .submit_batch(
                vec![EventInput::new("F1", now), EventInput::new("F2", now)],
                Duration::ZERO,
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(EngineError::Timeout { .. }))));
        assert_eq!(store.stats().high_water, 0);
    }

    #[tokio::test]
    async fn test_submit_acknowledges_and_indexes() {
        let store = EventStore::in_memory(StoreOptions::default());
        let ingestor = Ingestor::new(store.clone(), 3);
        let now = Utc::now();

        let id = ingestor
            .submit(EventInput::new("F1", now), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let range = TimeRange::new(now, now + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(store.query(&range, &EventFilter::default()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let store = EventStore::in_memory(StoreOptions::default());
        let ingestor = Ingestor::new(store.clone(), 5);
        let mut input = EventInput::new("F1", Utc::now());
        input.timestamp = None;

        let err = ingestor
            .submit(input, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.stats().high_water, 0);
    }

    #[tokio::test]
    async fn test_batch_reports_each_event() {
        let store = EventStore::in_memory(StoreOptions::default());
        let ingestor = Ingestor::new(store, 1);
        let now = Utc::now();
        let results = ingestor
            .submit_batch(
                vec![
                    EventInput::new("F1", now),
                    EventInput::new("", now),
                    EventInput::new("F2", now),
                ],
                Duration::from_secs(2),
            )
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EngineError::Validation(_))));
        assert!(results[2].is_ok());
    }
}
