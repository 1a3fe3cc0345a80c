//! One fixed-width time shard of the event index.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::event::{Event, TimeRange};

#[derive(Default)]
struct ShardData {
    /// Append order; sorted on read.
    events: Vec<Arc<Event>>,
    /// Entity name to positions in `events`.
    by_entity: HashMap<String, Vec<usize>>,
}

/// Events whose timestamps fall in `[start_ms, end_ms)`.
///
/// Writers serialize on the shard's write lock; readers copy out handles
/// under the read lock and release it before yielding anything.
pub struct Shard {
    start_ms: i64,
    end_ms: i64,
    data: RwLock<ShardData>,
}

impl Shard {
    pub fn new(start_ms: i64, width_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms: start_ms + width_ms,
            data: RwLock::new(ShardData::default()),
        }
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }

    pub fn push(&self, event: Arc<Event>) {
        let mut data = self.data.write().unwrap_or_else(|p| p.into_inner());
        let pos = data.events.len();
        data.by_entity
            .entry(event.entity.clone())
            .or_default()
            .push(pos);
        data.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out events in `range` with sequence id `<= high_water`,
    /// optionally restricted to `entities`, sorted by (timestamp, id).
    pub fn collect(
        &self,
        range: &TimeRange,
        high_water: u64,
        entities: Option<&[String]>,
    ) -> Vec<Arc<Event>> {
        let (start, end) = (range.start_ms(), range.end_ms());
        let visible = |e: &Arc<Event>| {
            e.id <= high_water && {
                let ts = e.timestamp_ms();
                ts >= start && ts < end
            }
        };

        let mut out: Vec<Arc<Event>> = {
            let data = self.data.read().unwrap_or_else(|p| p.into_inner());
            match entities {
                None => data.events.iter().filter(|e| visible(e)).cloned().collect(),
                Some(names) => names
                    .iter()
                    .filter_map(|name| data.by_entity.get(name))
                    .flatten()
                    .map(|&pos| &data.events[pos])
                    .filter(|e| visible(e))
                    .cloned()
                    .collect(),
            }
        };

        out.sort_by_key(|e| (e.timestamp_ms(), e.id));
        out
    }

    /// (oldest, newest) event timestamps in milliseconds.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        let data = self.data.read().unwrap_or_else(|p| p.into_inner());
        data.events.iter().fold(None, |acc, e| {
            let ts = e.timestamp_ms();
            Some(match acc {
                None => (ts, ts),
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
            })
        })
    }
}
