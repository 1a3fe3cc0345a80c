//! Summarize-result cache keyed by (pipeline hash, range, bucket size).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::event::{Event, TimeRange};
use crate::query::{Pipeline, QueryOutput};
use crate::storage::IngestObserver;

pub const DEFAULT_CAPACITY: usize = 256;

/// Append timestamps remembered for rejecting results computed before them.
const APPEND_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub pipeline_hash: u64,
    pub range: TimeRange,
    pub bucket_ms: Option<u128>,
}

impl CacheKey {
    pub fn new(pipeline: &Pipeline, range: &TimeRange) -> Self {
        Self {
            pipeline_hash: pipeline.fingerprint(),
            range: *range,
            bucket_ms: pipeline.bucket_size().map(|d| d.as_millis()),
        }
    }
}

struct Entry {
    output: Arc<QueryOutput>,
    last_used: AtomicU64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// Appends observed so far.
    generation: u64,
    /// (generation, timestamp) of the latest appends, oldest first.
    recent: VecDeque<(u64, DateTime<Utc>)>,
}

impl Inner {
    /// True when an append after `seen` landed in `range`, or when the
    /// history no longer reaches back to `seen`.
    fn stale_since(&self, seen: u64, range: &TimeRange) -> bool {
        if self.generation == seen {
            return false;
        }
        match self.recent.front() {
            Some((oldest, _)) if *oldest <= seen + 1 => self
                .recent
                .iter()
                .any(|(generation, ts)| *generation > seen && range.contains(*ts)),
            _ => true,
        }
    }
}

/// Entries are dropped as soon as an ingested event lands inside their range,
/// and the least recently used entry is evicted once `capacity` is reached.
pub struct QueryCache {
    inner: RwLock<Inner>,
    capacity: usize,
    clock: AtomicU64,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Appends observed so far. Read it before scanning and hand it to `insert`.
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).generation
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<QueryOutput>> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let entry = inner.entries.get(key)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&entry.output))
    }

    /// Store `output` unless an overlapping event was appended after
    /// `seen_generation`. Returns whether the entry was kept.
    pub fn insert(&self, key: CacheKey, output: Arc<QueryOutput>, seen_generation: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.stale_since(seen_generation, &key.range) {
            debug!(range = %key.range, "skipping cache insert, range changed during scan");
            return false;
        }
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
            }
        }
        let entry = Entry {
            output,
            last_used: AtomicU64::new(self.tick()),
        };
        inner.entries.insert(key, entry);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an append at `ts` and drop entries whose range covers it.
    pub fn invalidate_at(&self, ts: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.generation += 1;
        let generation = inner.generation;
        if inner.recent.len() == APPEND_HISTORY {
            inner.recent.pop_front();
        }
        inner.recent.push_back((generation, ts));

        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.range.contains(ts));
        before - inner.entries.len()
    }

    /// Drop entries whose range reaches before `horizon`.
    pub fn invalidate_before(&self, horizon: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let before = inner.entries.len();
        inner.entries.retain(|key, _| key.range.start >= horizon);
        before - inner.entries.len()
    }
}

impl IngestObserver for QueryCache {
    fn on_append(&self, event: &Event) {
        let dropped = self.invalidate_at(event.timestamp);
        if dropped > 0 {
            debug!(dropped, entity = %event.entity, "invalidated cached query results");
        }
    }

    fn on_purge(&self, horizon: DateTime<Utc>) {
        let dropped = self.invalidate_before(horizon);
        if dropped > 0 {
            debug!(dropped, %horizon, "dropped cached results covering purged events");
        }
    }
}
