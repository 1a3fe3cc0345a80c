//! Event store -- time-sharded in-memory index journaled to SQLite.

pub mod ingest;
pub mod journal;
pub mod schema;
mod shard;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::EngineResult;
use crate::event::{align_down, Event, EventInput, Level, TimeRange};

pub use self::ingest::Ingestor;
pub use self::journal::Journal;
use self::shard::Shard;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Sizing and retention knobs for an [`EventStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub shard_width_ms: i64,
    pub max_event_bytes: usize,
    pub retention: chrono::Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        (&StorageConfig::default()).into()
    }
}

impl From<&StorageConfig> for StoreOptions {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            shard_width_ms: cfg.shard_width.as_millis().max(1) as i64,
            max_event_bytes: cfg.max_event_bytes,
            retention: cfg.retention(),
        }
    }
}

/// Notified after every acknowledged append.
pub trait IngestObserver: Send + Sync {
    fn on_append(&self, event: &Event);

    /// Events older than `horizon` were evicted by the retention sweep.
    fn on_purge(&self, _horizon: DateTime<Utc>) {}
}

/// Restricts which events a store scan yields.
#[derive(Clone, Default)]
pub struct EventFilter {
    /// Served from the entity index when set.
    pub entities: Option<Vec<String>>,
    pub min_level: Option<Level>,
    pub predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl EventFilter {
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            entities: Some(vec![name.into()]),
            ..Self::default()
        }
    }

    pub fn with_predicate(mut self, f: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    fn accepts(&self, event: &Event) -> bool {
        if let Some(min) = self.min_level {
            if event.level < min {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p(event))
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("entities", &self.entities)
            .field("min_level", &self.min_level)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub shards: usize,
    pub events: usize,
    pub high_water: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct StoreInner {
    options: StoreOptions,
    shards: RwLock<BTreeMap<i64, Arc<Shard>>>,
    /// Highest committed sequence id. Every id at or below it is indexed.
    seq: AtomicU64,
    /// Serializes id assignment with journaling and indexing.
    commit: Mutex<()>,
    journal: Option<Journal>,
    observers: RwLock<Vec<Arc<dyn IngestObserver>>>,
}

/// Append-only, time-indexed event storage.
///
/// Cloning is cheap; all clones share the same shards.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    /// A store without a journal. Events do not survive the process.
    pub fn in_memory(options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                options,
                shards: RwLock::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
                commit: Mutex::new(()),
                journal: None,
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// A journaled store, rebuilt from whatever the journal still holds.
    pub fn open(options: StoreOptions, journal: Journal) -> EngineResult<Self> {
        let horizon = (Utc::now() - options.retention).timestamp_millis();
        let events = journal.replay(horizon)?;
        let max_id = journal.max_id()?;

        let store = Self {
            inner: Arc::new(StoreInner {
                options,
                shards: RwLock::new(BTreeMap::new()),
                seq: AtomicU64::new(max_id),
                commit: Mutex::new(()),
                journal: Some(journal),
                observers: RwLock::new(Vec::new()),
            }),
        };

        let count = events.len();
        for event in events {
            store.index(Arc::new(event));
        }
        info!(events = count, high_water = max_id, "event store recovered from journal");
        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.inner.journal.as_ref()
    }

    pub fn subscribe(&self, observer: Arc<dyn IngestObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(observer);
    }

    /// Validate, journal and index one event. Returns its sequence id.
    ///
    /// The event is durable once this returns `Ok` (when a journal is attached).
    pub fn append(&self, input: EventInput) -> EngineResult<u64> {
        let mut event = input.validate(self.inner.options.max_event_bytes)?;

        let event = {
            let _commit = self.inner.commit.lock().unwrap_or_else(|p| p.into_inner());
            event.id = self.inner.seq.load(Ordering::SeqCst) + 1;
            if let Some(journal) = &self.inner.journal {
                journal.insert(&event)?;
            }
            let event = Arc::new(event);
            self.index(Arc::clone(&event));
            // Publish only once the event is visible to scans.
            self.inner.seq.store(event.id, Ordering::SeqCst);
            event
        };

        for observer in self
            .inner
            .observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
        {
            observer.on_append(&event);
        }

        debug!(id = event.id, entity = %event.entity, "event appended");
        Ok(event.id)
    }

    fn index(&self, event: Arc<Event>) {
        let width = self.inner.options.shard_width_ms;
        let key = align_down(event.timestamp_ms(), width);

        let existing = self
            .inner
            .shards
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .cloned();

        let shard = match existing {
            Some(shard) => shard,
            None => {
                let mut shards = self.inner.shards.write().unwrap_or_else(|p| p.into_inner());
                Arc::clone(
                    shards
                        .entry(key)
                        .or_insert_with(|| Arc::new(Shard::new(key, width))),
                )
            }
        };
        shard.push(event);
    }

    /// Snapshot scan of `range`, ordered by timestamp then ingestion order.
    ///
    /// Events appended after this call returns are never yielded, and a
    /// concurrent retention sweep cannot remove shards the scan captured.
    pub fn query(&self, range: &TimeRange, filter: &EventFilter) -> EngineResult<EventIter> {
        range.check()?;
        let high_water = self.inner.seq.load(Ordering::SeqCst);

        let shards: VecDeque<Arc<Shard>> = {
            let shards = self.inner.shards.read().unwrap_or_else(|p| p.into_inner());
            let width = self.inner.options.shard_width_ms;
            let first = align_down(range.start_ms(), width);
            shards
                .range(first..range.end_ms())
                .map(|(_, s)| Arc::clone(s))
                .collect()
        };

        let mut entities = filter.entities.clone();
        if let Some(names) = entities.as_mut() {
            names.sort();
            names.dedup();
        }

        Ok(EventIter {
            range: *range,
            high_water,
            entities,
            filter: filter.clone(),
            shards,
            current: Vec::new().into_iter(),
        })
    }

    /// Drop shards that ended before the retention horizon.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let horizon = (now - self.inner.options.retention).timestamp_millis();

        let removed: Vec<Arc<Shard>> = {
            let mut shards = self.inner.shards.write().unwrap_or_else(|p| p.into_inner());
            let expired: Vec<i64> = shards
                .values()
                .take_while(|s| s.end_ms() <= horizon)
                .map(|s| s.start_ms())
                .collect();
            expired.iter().filter_map(|k| shards.remove(k)).collect()
        };
        let events: usize = removed.iter().map(|s| s.len()).sum();

        if let Some(journal) = &self.inner.journal {
            // Journal rows follow shard granularity so a restart restores the same view.
            let cutoff = removed
                .iter()
                .map(|s| s.end_ms())
                .max()
                .unwrap_or(i64::MIN);
            if cutoff > i64::MIN {
                journal.purge_before(cutoff)?;
            }
        }

        if let Some(cutoff) = removed
            .iter()
            .map(|s| s.end_ms())
            .max()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
        {
            info!(shards = removed.len(), events, "retention sweep evicted shards");
            for observer in self
                .inner
                .observers
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
            {
                observer.on_purge(cutoff);
            }
        }
        Ok(events)
    }

    pub fn stats(&self) -> StoreStats {
        let shards = self.inner.shards.read().unwrap_or_else(|p| p.into_inner());
        let mut events = 0;
        let mut bounds: Option<(i64, i64)> = None;
        for shard in shards.values() {
            events += shard.len();
            if let Some((lo, hi)) = shard.bounds() {
                bounds = Some(match bounds {
                    None => (lo, hi),
                    Some((a, b)) => (a.min(lo), b.max(hi)),
                });
            }
        }
        let to_dt = |ms: i64| DateTime::<Utc>::from_timestamp_millis(ms);
        StoreStats {
            shards: shards.len(),
            events,
            high_water: self.inner.seq.load(Ordering::SeqCst),
            oldest: bounds.and_then(|(lo, _)| to_dt(lo)),
            newest: bounds.and_then(|(_, hi)| to_dt(hi)),
        }
    }
}

/// Lazy iterator over one store snapshot.
pub struct EventIter {
    range: TimeRange,
    high_water: u64,
    entities: Option<Vec<String>>,
    filter: EventFilter,
    shards: VecDeque<Arc<Shard>>,
    current: std::vec::IntoIter<Arc<Event>>,
}

impl EventIter {
    /// Sequence id bounding this snapshot.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }
}

impl Iterator for EventIter {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for event in self.current.by_ref() {
                if self.filter.accepts(&event) {
                    return Some(event);
                }
            }
            let shard = self.shards.pop_front()?;
            self.current = shard
                .collect(&self.range, self.high_water, self.entities.as_deref())
                .into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn store() -> EventStore {
        EventStore::in_memory(StoreOptions::default())
    }

    #[test]
    fn test_appended_event_visible_exactly_once() {
        let store = store();
        let t = t0() + Duration::milliseconds(1234);
        let id = store.append(EventInput::new("F1", t)).unwrap();

        let range = TimeRange::new(t, t + Duration::milliseconds(1)).unwrap();
        let hits: Vec<_> = store.query(&range, &EventFilter::default()).unwrap().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn test_query_rejects_empty_range() {
        let store = store();
        let range = TimeRange {
            start: t0(),
            end: t0(),
        };
        assert!(matches!(
            store.query(&range, &EventFilter::default()),
            Err(crate::error::EngineError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_results_ordered_across_shards_and_out_of_order_appends() {
        let store = store();
        // Appended newest first, spread across three hourly shards.
        for offset in [150, 5, 95, 30, 61] {
            store
                .append(EventInput::new("F1", t0() + Duration::minutes(offset)))
                .unwrap();
        }
        let range = TimeRange::new(t0(), t0() + Duration::hours(3)).unwrap();
        let ts: Vec<_> = store
            .query(&range, &EventFilter::default())
            .unwrap()
            .map(|e| e.timestamp)
            .collect();
        let mut sorted = ts.clone();
        sorted.sort();
        assert_eq!(ts, sorted);
        assert_eq!(ts.len(), 5);
        assert_eq!(store.stats().shards, 3);
    }

    #[test]
    fn test_entity_index_filters() {
        let store = store();
        for i in 0..10 {
            let entity = if i % 2 == 0 { "F1" } else { "F2" };
            store
                .append(EventInput::new(entity, t0() + Duration::seconds(i)))
                .unwrap();
        }
        let range = TimeRange::new(t0(), t0() + Duration::minutes(1)).unwrap();
        let f2: Vec<_> = store
            .query(&range, &EventFilter::entity("F2"))
            .unwrap()
            .collect();
        assert_eq!(f2.len(), 5);
        assert!(f2.iter().all(|e| e.entity == "F2"));
    }

    #[test]
    fn test_snapshot_excludes_later_appends() {
        let store = store();
        store.append(EventInput::new("F1", t0())).unwrap();
        let range = TimeRange::new(t0(), t0() + Duration::hours(1)).unwrap();

        let iter = store.query(&range, &EventFilter::default()).unwrap();
        store
            .append(EventInput::new("F1", t0() + Duration::seconds(1)))
            .unwrap();
        assert_eq!(iter.count(), 1);

        // A fresh call sees both.
        assert_eq!(store.query(&range, &EventFilter::default()).unwrap().count(), 2);
    }

    #[test]
    fn test_purge_invisible_to_running_query() {
        let store = store();
        let old = Utc::now() - Duration::days(60);
        store.append(EventInput::new("F1", old)).unwrap();
        let range = TimeRange::new(old - Duration::hours(1), old + Duration::hours(1)).unwrap();

        let iter = store.query(&range, &EventFilter::default()).unwrap();
        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 1);
        assert_eq!(iter.count(), 1);
        assert_eq!(store.query(&range, &EventFilter::default()).unwrap().count(), 0);
    }

    #[test]
    fn test_snapshot_watermark_covers_only_indexed_events() {
        let store = store();
        let range = TimeRange::new(t0(), t0() + Duration::hours(1)).unwrap();
        std::thread::scope(|scope| {
            for w in 0..4i64 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..250i64 {
                        let ts = t0() + Duration::milliseconds(w * 1000 + i);
                        store.append(EventInput::new("F1", ts)).unwrap();
                    }
                });
            }
            let reader = store.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    let iter = reader.query(&range, &EventFilter::default()).unwrap();
                    let high_water = iter.high_water();
                    let ids: Vec<u64> = iter.map(|e| e.id).collect();
                    assert_eq!(ids.len() as u64, high_water);
                    assert!(ids.iter().all(|id| *id <= high_water));
                }
            });
        });
        assert_eq!(store.stats().high_water, 1000);
        assert_eq!(store.query(&range, &EventFilter::default()).unwrap().count(), 1000);
    }

    #[test]
    fn test_failed_journal_write_does_not_advance_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("events.db").to_str().unwrap()).unwrap();
        let store = EventStore::open(StoreOptions::default(), Journal::new(pool.clone())).unwrap();
        let now = Utc::now();
        assert_eq!(store.append(EventInput::new("F1", now)).unwrap(), 1);

        let conn = pool.get().unwrap();
        conn.execute_batch("DROP TABLE events").unwrap();
        assert!(store.append(EventInput::new("F1", now)).is_err());
        assert_eq!(store.stats().high_water, 1);
        assert_eq!(store.stats().events, 1);

        schema::migrate(&conn).unwrap();
        assert_eq!(store.append(EventInput::new("F1", now)).unwrap(), 2);
    }

    #[test]
    fn test_purge_notifies_observers_with_horizon() {
        #[derive(Default)]
        struct Horizons(Mutex<Vec<DateTime<Utc>>>);
        impl IngestObserver for Horizons {
            fn on_append(&self, _event: &Event) {}
            fn on_purge(&self, horizon: DateTime<Utc>) {
                self.0.lock().unwrap().push(horizon);
            }
        }

        let store = store();
        let seen = Arc::new(Horizons::default());
        store.subscribe(seen.clone());
        store.append(EventInput::new("F1", Utc::now() - Duration::days(60))).unwrap();

        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 1);
        // Nothing left to evict, so no second notification.
        assert_eq!(store.purge_expired(Utc::now()).unwrap(), 0);
        let horizons = seen.0.lock().unwrap();
        assert_eq!(horizons.len(), 1);
        assert!(horizons[0] < Utc::now() - Duration::days(59));
    }

    #[test]
    fn test_journal_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let now = Utc::now();
        {
            let journal = Journal::new(open_pool(path.to_str().unwrap()).unwrap());
            let store = EventStore::open(StoreOptions::default(), journal).unwrap();
            store
                .append(EventInput::new("F1", now).with_message("kept"))
                .unwrap();
        }
        let journal = Journal::new(open_pool(path.to_str().unwrap()).unwrap());
        let store = EventStore::open(StoreOptions::default(), journal).unwrap();
        let range = TimeRange::new(now - Duration::minutes(1), now + Duration::minutes(1)).unwrap();
        let events: Vec<_> = store.query(&range, &EventFilter::default()).unwrap().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "kept");

        // Sequence ids keep increasing after recovery.
        let id = store.append(EventInput::new("F1", now)).unwrap();
        assert_eq!(id, 2);
    }
}
