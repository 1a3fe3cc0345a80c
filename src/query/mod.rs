//! Query engine -- filter/extract/project/summarize/order pipelines over a time range.
//!
//! Events stream through the filter, extract and project stages straight off
//! a store snapshot; only a summarize stage materializes state. Every
//! pipeline is validated against the fields in scope before any event is read.

pub mod cache;
pub mod predicate;
pub mod record;

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::duration_str;
use crate::error::{EngineError, EngineResult};
use crate::event::TimeRange;
use crate::storage::{EventFilter, EventStore};
use crate::window::{Aggregation, AggregationKind, Bucket, WindowSpec, Windower};

use self::cache::{CacheKey, QueryCache};
use self::predicate::{CompiledPredicate, Predicate};
use self::record::{as_number, value_text, Fields, Record, Row, BUILTIN_FIELDS, PROPERTIES_PREFIX};

/// Events between cancellation and deadline checks.
const CHECKPOINT_EVERY: u64 = 1024;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

fn default_extract_source() -> String {
    "message".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Filter {
        predicate: Predicate,
    },
    /// Copy a regex capture from `source` into `field`, null when unmatched.
    Extract {
        pattern: String,
        #[serde(default = "default_extract_source")]
        source: String,
        field: String,
    },
    Project {
        fields: Vec<String>,
    },
    Summarize {
        aggregations: Vec<Aggregation>,
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(
            default,
            with = "duration_str::option",
            skip_serializing_if = "Option::is_none"
        )]
        bucket: Option<Duration>,
    },
    OrderBy {
        field: String,
        #[serde(default)]
        direction: Direction,
    },
    Limit {
        count: usize,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Filter { .. } => "filter",
            Stage::Extract { .. } => "extract",
            Stage::Project { .. } => "project",
            Stage::Summarize { .. } => "summarize",
            Stage::OrderBy { .. } => "order_by",
            Stage::Limit { .. } => "limit",
        }
    }
}

/// Ordered list of stages applied to the events in a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.stages.push(Stage::Filter { predicate });
        self
    }

    pub fn extract(
        mut self,
        pattern: impl Into<String>,
        source: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.stages.push(Stage::Extract {
            pattern: pattern.into(),
            source: source.into(),
            field: field.into(),
        });
        self
    }

    pub fn project<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.stages.push(Stage::Project {
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn summarize<S: Into<String>>(
        mut self,
        aggregations: Vec<Aggregation>,
        group_by: impl IntoIterator<Item = S>,
        bucket: Option<Duration>,
    ) -> Self {
        self.stages.push(Stage::Summarize {
            aggregations,
            group_by: group_by.into_iter().map(Into::into).collect(),
            bucket,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.stages.push(Stage::OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.stages.push(Stage::Limit { count });
        self
    }

    pub fn is_summarizing(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, Stage::Summarize { .. }))
    }

    pub fn bucket_size(&self) -> Option<Duration> {
        self.stages.iter().find_map(|s| match s {
            Stage::Summarize { bucket, .. } => *bucket,
            _ => None,
        })
    }

    /// Stable hash of the descriptor; identifies ad-hoc pipelines.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(self)
            .unwrap_or_default()
            .hash(&mut hasher);
        hasher.finish()
    }

    /// Validate against the fields in scope at each stage and compile patterns.
    pub fn compile(&self) -> EngineResult<CompiledPipeline> {
        let mut scope = Scope::initial();
        let mut pre = Vec::new();
        let mut summarize = None;
        let mut post = Vec::new();
        // Columns of the latest projection; extract appends to it.
        let mut projection: Option<Vec<String>> = None;

        for (idx, stage) in self.stages.iter().enumerate() {
            let streaming = summarize.is_none() && post.is_empty();
            match stage {
                Stage::Filter { predicate } => {
                    if !streaming && summarize.is_none() {
                        return Err(EngineError::pipeline(
                            idx,
                            "filter must come before order_by/limit",
                        ));
                    }
                    for f in predicate.fields() {
                        scope.require(idx, f)?;
                    }
                    let compiled = predicate.compile()?;
                    if streaming {
                        pre.push(Step::Filter(compiled));
                    } else {
                        post.push(Post::Filter(compiled));
                    }
                }
                Stage::Extract {
                    pattern,
                    source,
                    field,
                } => {
                    if !streaming {
                        return Err(misplaced(idx, stage));
                    }
                    scope.require(idx, source)?;
                    if is_reserved(field) {
                        return Err(EngineError::pipeline(
                            idx,
                            format!("extract cannot overwrite reserved field '{field}'"),
                        ));
                    }
                    let regex = Regex::new(pattern).map_err(|e| {
                        EngineError::validation(format!("invalid extract pattern '{pattern}': {e}"))
                    })?;
                    let group = if regex.capture_names().flatten().any(|n| n == field) {
                        CaptureGroup::Named(field.clone())
                    } else if regex.captures_len() > 1 {
                        CaptureGroup::Index(1)
                    } else {
                        CaptureGroup::Index(0)
                    };
                    scope.fields.insert(field.clone());
                    pre.push(Step::Extract {
                        regex,
                        source: source.clone(),
                        field: field.clone(),
                        group,
                    });
                    if let Some(cols) = projection.as_mut() {
                        if !cols.contains(field) {
                            cols.push(field.clone());
                            pre.push(Step::Project(Arc::from(cols.clone())));
                        }
                    }
                }
                Stage::Project { fields } => {
                    if !streaming {
                        return Err(misplaced(idx, stage));
                    }
                    if fields.is_empty() {
                        return Err(EngineError::pipeline(idx, "project needs at least one field"));
                    }
                    for f in fields {
                        scope.require(idx, f)?;
                    }
                    scope = Scope::closed(fields.iter().cloned());
                    projection = Some(fields.clone());
                    pre.push(Step::Project(Arc::from(fields.clone())));
                }
                Stage::Summarize {
                    aggregations,
                    group_by,
                    bucket,
                } => {
                    if summarize.is_some() {
                        return Err(EngineError::pipeline(idx, "only one summarize stage is allowed"));
                    }
                    if !post.is_empty() {
                        return Err(misplaced(idx, stage));
                    }
                    for f in group_by {
                        scope.require(idx, f)?;
                    }
                    let mut outputs: BTreeSet<String> = group_by.iter().cloned().collect();
                    for agg in aggregations {
                        for f in agg.fields() {
                            scope.require(idx, f)?;
                        }
                        if let AggregationKind::Percentile { p, .. } = &agg.kind {
                            if !(0.0..=100.0).contains(p) {
                                return Err(EngineError::pipeline(
                                    idx,
                                    format!("percentile {p} is outside [0, 100]"),
                                ));
                            }
                        }
                        if !outputs.insert(agg.name()) {
                            return Err(EngineError::pipeline(
                                idx,
                                format!("duplicate output column '{}'", agg.name()),
                            ));
                        }
                    }
                    let spec = WindowSpec::new(*bucket, group_by.clone(), aggregations)?;
                    outputs.extend(
                        ["window_start", "window_end", "count", "group_key"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                    scope = Scope::closed(outputs);
                    summarize = Some(spec);
                }
                Stage::OrderBy { field, direction } => {
                    scope.require(idx, field)?;
                    post.push(Post::OrderBy {
                        field: field.clone(),
                        direction: *direction,
                    });
                }
                Stage::Limit { count } => post.push(Post::Limit(*count)),
            }
        }

        // Only streaming filters see raw events.
        let entity_hint = self
            .stages
            .iter()
            .take_while(|s| {
                matches!(
                    s,
                    Stage::Filter { .. } | Stage::Extract { .. } | Stage::Project { .. }
                )
            })
            .find_map(|s| match s {
                Stage::Filter { predicate } => predicate.entity_hint(),
                _ => None,
            });

        Ok(CompiledPipeline {
            pre,
            summarize,
            post,
            entity_hint,
        })
    }
}

fn misplaced(idx: usize, stage: &Stage) -> EngineError {
    EngineError::pipeline(
        idx,
        format!("{} must come before summarize/order_by/limit", stage.name()),
    )
}

fn is_reserved(field: &str) -> bool {
    BUILTIN_FIELDS.contains(&field) || field == "properties" || field.starts_with(PROPERTIES_PREFIX)
}

/// Fields a stage may reference.
struct Scope {
    fields: BTreeSet<String>,
    properties_open: bool,
}

impl Scope {
    fn initial() -> Self {
        Self {
            fields: BUILTIN_FIELDS.iter().map(|s| s.to_string()).collect(),
            properties_open: true,
        }
    }

    fn closed(fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            properties_open: false,
        }
    }

    fn require(&self, stage: usize, field: &str) -> EngineResult<()> {
        let open_property = self.properties_open
            && field
                .strip_prefix(PROPERTIES_PREFIX)
                .is_some_and(|k| !k.is_empty());
        if open_property || self.fields.contains(field) {
            Ok(())
        } else {
            Err(EngineError::pipeline(
                stage,
                format!("field '{field}' is not defined at this stage"),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CaptureGroup {
    Named(String),
    Index(usize),
}

#[derive(Debug)]
enum Step {
    Filter(CompiledPredicate),
    Extract {
        regex: Regex,
        source: String,
        field: String,
        group: CaptureGroup,
    },
    Project(Arc<[String]>),
}

impl Step {
    /// `false` drops the record.
    fn apply(&self, record: &mut Record) -> bool {
        match self {
            Step::Filter(p) => p.eval(record),
            Step::Extract {
                regex,
                source,
                field,
                group,
            } => {
                let text = value_text(&record.field(source));
                let captured = regex.captures(&text).and_then(|caps| {
                    match group {
                        CaptureGroup::Named(name) => caps.name(name),
                        CaptureGroup::Index(i) => caps.get(*i),
                    }
                    .map(|m| m.as_str().to_string())
                });
                record.set(field, captured.map_or(Value::Null, Value::String));
                true
            }
            Step::Project(fields) => {
                record.project(Arc::clone(fields));
                true
            }
        }
    }
}

#[derive(Debug)]
enum Post {
    Filter(CompiledPredicate),
    OrderBy { field: String, direction: Direction },
    Limit(usize),
}

/// A validated pipeline ready to run.
#[derive(Debug)]
pub struct CompiledPipeline {
    pre: Vec<Step>,
    summarize: Option<WindowSpec>,
    post: Vec<Post>,
    entity_hint: Option<Vec<String>>,
}

impl CompiledPipeline {
    /// Rows can stop streaming once a limit ahead of any sort is reached.
    fn early_limit(&self) -> Option<usize> {
        if self.summarize.is_some() {
            return None;
        }
        for step in &self.post {
            match step {
                Post::Limit(n) => return Some(*n),
                Post::OrderBy { .. } => return None,
                Post::Filter(_) => {}
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Buckets(Vec<Bucket>),
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Rows(r) => r.len(),
            QueryOutput::Buckets(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buckets(&self) -> Option<&[Bucket]> {
        match self {
            QueryOutput::Buckets(b) => Some(b),
            QueryOutput::Rows(_) => None,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutput::Rows(r) => r,
            QueryOutput::Buckets(b) => b.iter().map(Bucket::to_row).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Caller-side bounds on one query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl QueryOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancellationToken::new(),
        }
    }
}

/// Cooperative cancellation state checked from inside the scan.
struct Guard {
    started: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Guard {
    fn check(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EngineError::Timeout {
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    store: EventStore,
    cache: Option<Arc<QueryCache>>,
}

impl QueryEngine {
    pub fn new(store: EventStore) -> Self {
        Self { store, cache: None }
    }

    /// An engine whose summarize results are cached until overlapping ingestion.
    pub fn with_cache(store: EventStore) -> Self {
        Self::with_cache_capacity(store, cache::DEFAULT_CAPACITY)
    }

    pub fn with_cache_capacity(store: EventStore, capacity: usize) -> Self {
        let cache = Arc::new(QueryCache::with_capacity(capacity));
        store.subscribe(cache.clone());
        Self {
            store,
            cache: Some(cache),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_deref()
    }

    /// Run `pipeline` off the async runtime, bounded by `options`.
    pub async fn run(
        &self,
        pipeline: Pipeline,
        range: TimeRange,
        options: QueryOptions,
    ) -> EngineResult<QueryOutput> {
        let started = tokio::time::Instant::now();
        let token = options.cancel.child_token();
        let worker_token = token.clone();
        let engine = self.clone();
        let timeout = options.timeout;

        let handle = tokio::task::spawn_blocking(move || {
            let opts = QueryOptions {
                timeout,
                cancel: worker_token,
            };
            engine.execute(&pipeline, &range, &opts)
        });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    warn!(elapsed_ms, "query exceeded its deadline, cancelling scan");
                    return Err(EngineError::Timeout { elapsed_ms });
                }
            },
            None => handle.await,
        };

        joined.map_err(|e| EngineError::Storage {
            message: format!("query task failed: {e}"),
            transient: false,
        })?
    }

    /// Synchronous execution; checks cancellation every 1024 events.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        range: &TimeRange,
        options: &QueryOptions,
    ) -> EngineResult<QueryOutput> {
        range.check()?;
        let compiled = pipeline.compile()?;
        let started = Instant::now();
        let guard = Guard {
            started,
            deadline: options.timeout.map(|t| started + t),
            cancel: options.cancel.clone(),
        };

        let cache_key = match (&self.cache, compiled.summarize.is_some()) {
            (Some(cache), true) => {
                let key = CacheKey::new(pipeline, range);
                if let Some(hit) = cache.get(&key) {
                    debug!(%range, "query cache hit");
                    return Ok((*hit).clone());
                }
                Some((key, cache.generation()))
            }
            _ => None,
        };

        let output = self.scan(&compiled, range, &guard)?;

        if let (Some(cache), Some((key, seen))) = (&self.cache, cache_key) {
            cache.insert(key, Arc::new(output.clone()), seen);
        }
        info!(
            %range,
            rows = output.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query complete"
        );
        Ok(output)
    }

    fn scan(
        &self,
        compiled: &CompiledPipeline,
        range: &TimeRange,
        guard: &Guard,
    ) -> EngineResult<QueryOutput> {
        let filter = EventFilter {
            entities: compiled.entity_hint.clone(),
            ..EventFilter::default()
        };
        let events = self.store.query(range, &filter)?;
        let early_limit = compiled.early_limit();

        let mut windower = compiled
            .summarize
            .clone()
            .map(|spec| Windower::new(spec, *range));
        let mut rows: Vec<Row> = Vec::new();
        let mut scanned: u64 = 0;

        guard.check()?;
        'events: for event in events {
            scanned += 1;
            if scanned % CHECKPOINT_EVERY == 0 {
                guard.check()?;
            }

            let mut record = Record::new(event);
            for step in &compiled.pre {
                if !step.apply(&mut record) {
                    continue 'events;
                }
            }

            match windower.as_mut() {
                Some(w) => w.push(&record),
                None => {
                    rows.push(record.into_row());
                    if early_limit.is_some_and(|n| rows.len() >= n) {
                        break;
                    }
                }
            }
        }
        guard.check()?;
        debug!(scanned, "scan finished");

        match windower {
            Some(w) => {
                let mut buckets = w.finish();
                apply_post(&compiled.post, &mut buckets);
                Ok(QueryOutput::Buckets(buckets))
            }
            None => {
                apply_post(&compiled.post, &mut rows);
                Ok(QueryOutput::Rows(rows))
            }
        }
    }
}

fn apply_post<T: Fields>(post: &[Post], items: &mut Vec<T>) {
    for step in post {
        match step {
            Post::Filter(p) => items.retain(|item| p.eval(item)),
            Post::OrderBy { field, direction } => {
                // Stable: ties keep their incoming order.
                items.sort_by(|a, b| sort_cmp(&a.field(field), &b.field(field), *direction));
            }
            Post::Limit(n) => items.truncate(*n),
        }
    }
}

/// Total order for sorting: numbers, then strings, then booleans, then
/// composites; nulls last in both directions.
fn sort_cmp(a: &Value, b: &Value, direction: Direction) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 4,
            Value::Bool(_) => 2,
            Value::Object(_) | Value::Array(_) => 3,
            v if as_number(v).is_some() => 0,
            _ => 1,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra == 4 || rb == 4 {
        return ra.cmp(&rb);
    }
    let ord = ra.cmp(&rb).then_with(|| match ra {
        0 => {
            let (x, y) = (as_number(a).unwrap_or(0.0), as_number(b).unwrap_or(0.0));
            x.total_cmp(&y)
        }
        2 => a.as_bool().cmp(&b.as_bool()),
        _ => value_text(a).cmp(&value_text(b)),
    });
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventInput;
    use crate::storage::StoreOptions;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    fn seeded() -> (EventStore, TimeRange) {
        let store = EventStore::in_memory(StoreOptions::default());
        for i in 0..20i64 {
            let entity = if i % 4 == 0 { "checkout" } else { "search" };
            let level = if i % 5 == 0 {
                crate::event::Level::Error
            } else {
                crate::event::Level::Info
            };
            store
                .append(
                    EventInput::new(entity, t0() + chrono::Duration::seconds(i * 30))
                        .with_level(level)
                        .with_message(format!("request done status={} in {}ms", 200 + (i % 3), 10 * i))
                        .with_property("duration_ms", 10 * i),
                )
                .unwrap();
        }
        (store, TimeRange::new(t0(), t0() + chrono::Duration::hours(1)).unwrap())
    }

    fn run(store: &EventStore, pipeline: &Pipeline, range: &TimeRange) -> EngineResult<QueryOutput> {
        QueryEngine::new(store.clone()).execute(pipeline, range, &QueryOptions::default())
    }

    #[test]
    fn test_filter_project_preserves_time_order() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .filter(Predicate::eq("entity", "search"))
            .project(["timestamp", "entity", "properties.duration_ms"]);
        let rows = run(&store, &pipeline, &range).unwrap().into_rows();
        assert_eq!(rows.len(), 15);
        let ts: Vec<String> = rows
            .iter()
            .map(|r| r["timestamp"].as_str().unwrap().to_string())
            .collect();
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rows[0].len(), 3);
    }

    #[test]
    fn test_extract_then_summarize() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .extract(r"status=(\d+)", "message", "status")
            .summarize(vec![Aggregation::count()], ["status"], None)
            .order_by("status", Direction::Asc);
        let output = run(&store, &pipeline, &range).unwrap();
        let buckets = output.buckets().unwrap();
        let keys: Vec<&str> = buckets.iter().map(|b| b.group_key.as_str()).collect();
        assert_eq!(keys, vec!["200", "201", "202"]);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<u64>(), 20);
    }

    #[test]
    fn test_bucket_rows_carry_group_key() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .summarize(vec![Aggregation::count()], ["entity"], None)
            .order_by("group_key", Direction::Desc);
        let rows = run(&store, &pipeline, &range).unwrap().into_rows();
        let keys: Vec<&Value> = rows.iter().map(|r| &r["group_key"]).collect();
        assert_eq!(keys, vec![&json!("search"), &json!("checkout")]);
        assert_eq!(rows[0]["entity"], json!("search"));
    }

    #[test]
    fn test_extract_after_project_keeps_extracted_column() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .project(["message"])
            .extract(r"status=(\d+)", "message", "status")
            .limit(1);
        let rows = run(&store, &pipeline, &range).unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0]["status"], json!("200"));
        assert!(rows[0]["message"].as_str().unwrap().contains("status=200"));
    }

    #[test]
    fn test_percentile_out_of_range_names_stage() {
        let pipeline = Pipeline::new()
            .filter(Predicate::eq("entity", "search"))
            .summarize(
                vec![Aggregation::percentile("properties.duration_ms", 150.0)],
                Vec::<String>::new(),
                None,
            );
        match pipeline.compile() {
            Err(EngineError::Pipeline { stage, reason }) => {
                assert_eq!(stage, 1);
                assert!(reason.contains("150"));
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_field_is_pipeline_error() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new().filter(Predicate::eq("status", "200"));
        assert!(matches!(
            run(&store, &pipeline, &range),
            Err(EngineError::Pipeline { stage: 0, .. })
        ));

        // Projection closes the scope.
        let pipeline = Pipeline::new()
            .project(["entity"])
            .filter(Predicate::eq("message", "x"));
        assert!(matches!(
            pipeline.compile(),
            Err(EngineError::Pipeline { stage: 1, .. })
        ));

        // Summarize outputs replace the event fields.
        let pipeline = Pipeline::new()
            .summarize(vec![Aggregation::count()], ["entity"], None)
            .order_by("message", Direction::Asc);
        assert!(matches!(
            pipeline.compile(),
            Err(EngineError::Pipeline { stage: 1, .. })
        ));
    }

    #[test]
    fn test_stage_misuse() {
        let twice = Pipeline::new()
            .summarize(vec![Aggregation::count()], Vec::<String>::new(), None)
            .summarize(vec![Aggregation::count()], Vec::<String>::new(), None);
        assert!(matches!(twice.compile(), Err(EngineError::Pipeline { stage: 1, .. })));

        let project_late = Pipeline::new()
            .order_by("timestamp", Direction::Desc)
            .project(["entity"]);
        assert!(project_late.compile().is_err());

        let reserved = Pipeline::new().extract("(.*)", "message", "entity");
        assert!(reserved.compile().is_err());
    }

    #[test]
    fn test_order_by_is_stable_desc() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .project(["id", "entity"])
            .order_by("entity", Direction::Desc);
        let rows = run(&store, &pipeline, &range).unwrap().into_rows();
        // "search" rows first, each entity block still in id order.
        assert_eq!(rows[0]["entity"], json!("search"));
        let search_ids: Vec<u64> = rows
            .iter()
            .filter(|r| r["entity"] == json!("search"))
            .map(|r| r["id"].as_u64().unwrap())
            .collect();
        assert!(search_ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_filter_after_summarize_and_limit() {
        let (store, range) = seeded();
        let pipeline = Pipeline::new()
            .summarize(
                vec![
                    Aggregation::count(),
                    Aggregation::new(AggregationKind::CountIf {
                        predicate: Predicate::eq("level", "Error"),
                    })
                    .alias("errors"),
                ],
                ["entity"],
                Some(Duration::from_secs(300)),
            )
            .filter(Predicate::ge("errors", 1))
            .order_by("errors", Direction::Desc)
            .limit(2);
        let output = run(&store, &pipeline, &range).unwrap();
        let buckets = output.buckets().unwrap();
        assert!(buckets.len() <= 2);
        assert!(buckets.iter().all(|b| b.metric("errors").unwrap() >= 1.0));
    }

    #[test]
    fn test_early_limit_on_rows() {
        let (store, range) = seeded();
        let rows = run(&store, &Pipeline::new().limit(3), &range)
            .unwrap()
            .into_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn test_cancelled_query() {
        let (store, range) = seeded();
        let options = QueryOptions::default();
        options.cancel.cancel();
        let result = QueryEngine::new(store).execute(&Pipeline::new(), &range, &options);
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_invalid_range() {
        let (store, _) = seeded();
        let bad = TimeRange {
            start: t0(),
            end: t0() - chrono::Duration::seconds(1),
        };
        assert!(matches!(
            run(&store, &Pipeline::new(), &bad),
            Err(EngineError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_cache_invalidated_by_overlapping_ingest() {
        let (store, range) = seeded();
        let engine = QueryEngine::with_cache(store.clone());
        let pipeline = Pipeline::new().summarize(
            vec![Aggregation::count()],
            Vec::<String>::new(),
            Some(Duration::from_secs(3600)),
        );
        let first = engine
            .execute(&pipeline, &range, &QueryOptions::default())
            .unwrap();
        assert_eq!(engine.cache().unwrap().len(), 1);

        // Outside the range: entry survives.
        store
            .append(EventInput::new("search", range.end + chrono::Duration::hours(2)))
            .unwrap();
        assert_eq!(engine.cache().unwrap().len(), 1);

        store
            .append(EventInput::new("search", t0() + chrono::Duration::minutes(1)))
            .unwrap();
        assert!(engine.cache().unwrap().is_empty());
        let second = engine
            .execute(&pipeline, &range, &QueryOptions::default())
            .unwrap();
        assert_eq!(first.buckets().unwrap()[0].count + 1, second.buckets().unwrap()[0].count);
    }

    #[test]
    fn test_pipeline_descriptor_deserializes() {
        let pipeline: Pipeline = serde_json::from_value(json!({
            "stages": [
                { "stage": "filter", "predicate": { "op": "eq", "field": "level", "value": "Error" } },
                { "stage": "summarize", "aggregations": [{ "fn": "count" }], "group_by": ["entity"], "bucket": "5m" },
                { "stage": "order_by", "field": "count", "direction": "desc" }
            ]
        }))
        .unwrap();
        assert_eq!(pipeline.bucket_size(), Some(Duration::from_secs(300)));
        assert!(pipeline.compile().is_ok());
    }

    #[tokio::test]
    async fn test_async_run_honours_timeout() {
        let (store, range) = seeded();
        let engine = QueryEngine::new(store);
        let output = engine
            .run(
                Pipeline::new(),
                range,
                QueryOptions::with_timeout(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(output.len(), 20);

        let zero = engine
            .run(Pipeline::new(), range, QueryOptions::with_timeout(Duration::ZERO))
            .await;
        assert!(matches!(zero, Err(EngineError::Timeout { .. })));
    }
}
