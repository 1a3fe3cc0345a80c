//! Aggregation windower -- epoch-aligned time buckets with per-group statistics.
//!
//! One [`Bucket`] is emitted per (slot, group key) pair that received at
//! least one record; empty slots are never materialized.

pub mod aggregate;
pub mod stats;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::event::{align_down, TimeRange};
use crate::query::record::{format_timestamp, value_text, Fields, Record};

pub use self::aggregate::{Accumulator, Aggregation, AggregationKind, CompiledAggregation};

/// Label used for the group key when a summarize has no `group_by`.
pub const ALL_GROUP: &str = "*";

/// Statistics for one time slot and group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Group-by field values.
    pub group: Map<String, Value>,
    /// Group values joined with `|`, or `*` without grouping.
    pub group_key: String,
    pub count: u64,
    /// Aggregation outputs by column name.
    pub stats: Map<String, Value>,
}

impl Bucket {
    /// Numeric reading of `count` or any aggregation column.
    pub fn metric(&self, name: &str) -> Option<f64> {
        if name == "count" && !self.stats.contains_key("count") {
            return Some(self.count as f64);
        }
        self.stats.get(name).and_then(Value::as_f64)
    }

    pub fn window(&self) -> TimeRange {
        TimeRange {
            start: self.window_start,
            end: self.window_end,
        }
    }

    /// Flatten into a row: window bounds, group fields, count and stats.
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert(
            "window_start".into(),
            Value::String(format_timestamp(&self.window_start)),
        );
        row.insert(
            "window_end".into(),
            Value::String(format_timestamp(&self.window_end)),
        );
        row.insert("group_key".into(), Value::String(self.group_key.clone()));
        for (k, v) in &self.group {
            row.insert(k.clone(), v.clone());
        }
        row.insert("count".into(), Value::from(self.count));
        for (k, v) in &self.stats {
            row.insert(k.clone(), v.clone());
        }
        row
    }
}

impl Fields for Bucket {
    fn field(&self, name: &str) -> Value {
        match name {
            "window_start" => Value::String(format_timestamp(&self.window_start)),
            "window_end" => Value::String(format_timestamp(&self.window_end)),
            "group_key" => Value::String(self.group_key.clone()),
            _ => {
                if let Some(v) = self.stats.get(name).or_else(|| self.group.get(name)) {
                    return v.clone();
                }
                if name == "count" {
                    return Value::from(self.count);
                }
                Value::Null
            }
        }
    }

    fn timestamp_ms(&self) -> Option<i64> {
        Some(self.window_start.timestamp_millis())
    }
}

/// What a summarize stage computes.
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub bucket_size: Option<Duration>,
    pub group_by: Vec<String>,
    pub aggregations: Vec<CompiledAggregation>,
}

impl WindowSpec {
    pub fn new(
        bucket_size: Option<Duration>,
        group_by: Vec<String>,
        aggregations: &[Aggregation],
    ) -> EngineResult<Self> {
        if let Some(size) = bucket_size {
            if size.as_millis() == 0 {
                return Err(EngineError::validation("bucket size must be positive"));
            }
        }
        Ok(Self {
            bucket_size,
            group_by,
            aggregations: aggregations
                .iter()
                .map(Aggregation::compile)
                .collect::<EngineResult<_>>()?,
        })
    }
}

struct Slot {
    start_ms: i64,
    end_ms: i64,
    group: Map<String, Value>,
    group_key: String,
    count: u64,
    accumulators: Vec<Accumulator>,
}

/// Streaming accumulator for one summarize over one range.
pub struct Windower {
    spec: WindowSpec,
    range: TimeRange,
    slots: HashMap<(i64, String), Slot>,
    seen: u64,
}

impl Windower {
    pub fn new(spec: WindowSpec, range: TimeRange) -> Self {
        Self {
            spec,
            range,
            slots: HashMap::new(),
            seen: 0,
        }
    }

    pub fn push<F: Fields + ?Sized>(&mut self, row: &F) {
        let (start_ms, end_ms) = match (self.spec.bucket_size, row.timestamp_ms()) {
            (Some(size), Some(ts)) => {
                let size = size.as_millis() as i64;
                let start = align_down(ts, size);
                (start, start + size)
            }
            _ => (self.range.start_ms(), self.range.end_ms()),
        };

        let values: Vec<Value> = self.spec.group_by.iter().map(|f| row.field(f)).collect();
        // Exact JSON encoding keeps ("a|b") and ("a", "b") apart.
        let exact = serde_json::to_string(&values).unwrap_or_default();

        let spec = &self.spec;
        let slot = self
            .slots
            .entry((start_ms, exact))
            .or_insert_with(|| {
                let group_key = if spec.group_by.is_empty() {
                    ALL_GROUP.to_string()
                } else {
                    values.iter().map(value_text).collect::<Vec<_>>().join("|")
                };
                Slot {
                    start_ms,
                    end_ms,
                    group: spec.group_by.iter().cloned().zip(values.iter().cloned()).collect(),
                    group_key,
                    count: 0,
                    accumulators: spec.aggregations.iter().map(|a| a.accumulator()).collect(),
                }
            });

        slot.count += 1;
        for acc in &mut slot.accumulators {
            acc.push(row);
        }
        self.seen += 1;
    }

    /// Records pushed so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Buckets ordered by window start, then group key.
    pub fn finish(self) -> Vec<Bucket> {
        let names: Vec<String> = self.spec.aggregations.iter().map(|a| a.name.clone()).collect();
        let mut keyed: Vec<((i64, String), Slot)> = self.slots.into_iter().collect();
        keyed.sort_by(|(ka, a), (kb, b)| {
            ka.0.cmp(&kb.0)
                .then_with(|| a.group_key.cmp(&b.group_key))
                .then_with(|| ka.1.cmp(&kb.1))
        });

        keyed
            .into_iter()
            .map(|(_, slot)| {
                let stats = names
                    .iter()
                    .cloned()
                    .zip(slot.accumulators.into_iter().map(Accumulator::finish))
                    .collect();
                Bucket {
                    window_start: to_datetime(slot.start_ms),
                    window_end: to_datetime(slot.end_ms),
                    group: slot.group,
                    group_key: slot.group_key,
                    count: slot.count,
                    stats,
                }
            })
            .collect()
    }
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Bucket `records` by `bucket_size` (or the whole `range`) and `group_keys`.
pub fn window<I>(
    records: I,
    range: TimeRange,
    bucket_size: Option<Duration>,
    group_keys: &[String],
    aggregations: &[Aggregation],
) -> EngineResult<Vec<Bucket>>
where
    I: IntoIterator<Item = Record>,
{
    range.check()?;
    let spec = WindowSpec::new(bucket_size, group_keys.to_vec(), aggregations)?;
    let mut windower = Windower::new(spec, range);
    for record in records {
        windower.push(&record);
    }
    Ok(windower.finish())
}
