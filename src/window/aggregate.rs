//! Aggregation functions and their per-bucket accumulators.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::query::predicate::{CompiledPredicate, Predicate};
use crate::query::record::{as_number, number_value, value_text, Fields};
use crate::window::stats::{percentile, DistinctCounter, Welford};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    #[serde(rename = "countif")]
    CountIf { predicate: Predicate },
    #[serde(rename = "dcount")]
    DCount { field: String },
    Sum { field: String },
    Avg { field: String },
    Min { field: String },
    Max { field: String },
    /// `p` in [0, 100].
    Percentile { field: String, p: f64 },
    #[serde(rename = "stddev")]
    StdDev { field: String },
}

/// One named output column of a summarize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(flatten)]
    pub kind: AggregationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(kind: AggregationKind) -> Self {
        Self { kind, alias: None }
    }

    pub fn count() -> Self {
        Self::new(AggregationKind::Count)
    }

    pub fn avg(field: impl Into<String>) -> Self {
        Self::new(AggregationKind::Avg {
            field: field.into(),
        })
    }

    pub fn percentile(field: impl Into<String>, p: f64) -> Self {
        Self::new(AggregationKind::Percentile {
            field: field.into(),
            p,
        })
    }

    pub fn stddev(field: impl Into<String>) -> Self {
        Self::new(AggregationKind::StdDev {
            field: field.into(),
        })
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name: the alias, or one derived from function and field.
    pub fn name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        let col = |prefix: &str, field: &str| format!("{prefix}_{}", field.replace('.', "_"));
        match &self.kind {
            AggregationKind::Count => "count".to_string(),
            AggregationKind::CountIf { .. } => "countif".to_string(),
            AggregationKind::DCount { field } => col("dcount", field),
            AggregationKind::Sum { field } => col("sum", field),
            AggregationKind::Avg { field } => col("avg", field),
            AggregationKind::Min { field } => col("min", field),
            AggregationKind::Max { field } => col("max", field),
            AggregationKind::Percentile { field, p } => col(&format!("p{p}"), field),
            AggregationKind::StdDev { field } => col("stddev", field),
        }
    }

    /// Fields read by this aggregation.
    pub fn fields(&self) -> Vec<&str> {
        match &self.kind {
            AggregationKind::Count => Vec::new(),
            AggregationKind::CountIf { predicate } => predicate.fields(),
            AggregationKind::DCount { field }
            | AggregationKind::Sum { field }
            | AggregationKind::Avg { field }
            | AggregationKind::Min { field }
            | AggregationKind::Max { field }
            | AggregationKind::Percentile { field, .. }
            | AggregationKind::StdDev { field } => vec![field.as_str()],
        }
    }

    pub fn compile(&self) -> EngineResult<CompiledAggregation> {
        if let AggregationKind::Percentile { p, .. } = &self.kind {
            if !(0.0..=100.0).contains(p) {
                return Err(EngineError::validation(format!(
                    "percentile {p} is outside [0, 100]"
                )));
            }
        }
        let predicate = match &self.kind {
            AggregationKind::CountIf { predicate } => Some(Arc::new(predicate.compile()?)),
            _ => None,
        };
        Ok(CompiledAggregation {
            name: self.name(),
            kind: self.kind.clone(),
            predicate,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledAggregation {
    pub name: String,
    kind: AggregationKind,
    predicate: Option<Arc<CompiledPredicate>>,
}

impl CompiledAggregation {
    pub fn accumulator(&self) -> Accumulator {
        match &self.kind {
            AggregationKind::Count => Accumulator::Count(0),
            AggregationKind::CountIf { .. } => Accumulator::CountIf {
                predicate: self.predicate.clone(),
                n: 0,
            },
            AggregationKind::DCount { field } => Accumulator::DCount {
                field: field.clone(),
                counter: DistinctCounter::default(),
            },
            AggregationKind::Sum { field } => Accumulator::Sum {
                field: field.clone(),
                sum: 0.0,
                seen: false,
            },
            AggregationKind::Avg { field } => Accumulator::Avg {
                field: field.clone(),
                w: Welford::new(),
            },
            AggregationKind::Min { field } => Accumulator::Min {
                field: field.clone(),
                v: None,
            },
            AggregationKind::Max { field } => Accumulator::Max {
                field: field.clone(),
                v: None,
            },
            AggregationKind::Percentile { field, p } => Accumulator::Percentile {
                field: field.clone(),
                p: *p,
                values: Vec::new(),
            },
            AggregationKind::StdDev { field } => Accumulator::StdDev {
                field: field.clone(),
                w: Welford::new(),
            },
        }
    }
}

/// Running state of one aggregation within one bucket.
#[derive(Debug, Clone)]
pub enum Accumulator {
    Count(u64),
    CountIf {
        predicate: Option<Arc<CompiledPredicate>>,
        n: u64,
    },
    DCount {
        field: String,
        counter: DistinctCounter,
    },
    Sum {
        field: String,
        sum: f64,
        seen: bool,
    },
    Avg {
        field: String,
        w: Welford,
    },
    Min {
        field: String,
        v: Option<f64>,
    },
    Max {
        field: String,
        v: Option<f64>,
    },
    /// Percentiles are exact: every value in the bucket is kept.
    Percentile {
        field: String,
        p: f64,
        values: Vec<f64>,
    },
    StdDev {
        field: String,
        w: Welford,
    },
}

impl Accumulator {
    pub fn push<F: Fields + ?Sized>(&mut self, row: &F) {
        let num = |field: &str| as_number(&row.field(field));
        match self {
            Self::Count(n) => *n += 1,
            Self::CountIf { predicate, n } => {
                if predicate.as_ref().map_or(false, |p| p.eval(row)) {
                    *n += 1;
                }
            }
            Self::DCount { field, counter } => {
                let v = row.field(field);
                if !v.is_null() {
                    counter.insert(value_text(&v));
                }
            }
            Self::Sum { field, sum, seen } => {
                if let Some(x) = num(field) {
                    *sum += x;
                    *seen = true;
                }
            }
            Self::Avg { field, w } | Self::StdDev { field, w } => {
                if let Some(x) = num(field) {
                    w.push(x);
                }
            }
            Self::Min { field, v } => {
                if let Some(x) = num(field) {
                    *v = Some(v.map_or(x, |cur| cur.min(x)));
                }
            }
            Self::Max { field, v } => {
                if let Some(x) = num(field) {
                    *v = Some(v.map_or(x, |cur| cur.max(x)));
                }
            }
            Self::Percentile { field, values, .. } => {
                if let Some(x) = num(field) {
                    values.push(x);
                }
            }
        }
    }

    /// Final value; null when no numeric input reached a numeric aggregation.
    pub fn finish(self) -> Value {
        match self {
            Self::Count(n) | Self::CountIf { n, .. } => Value::from(n),
            Self::DCount { counter, .. } => Value::from(counter.count()),
            Self::Sum { sum, seen, .. } => {
                if seen {
                    number_value(sum)
                } else {
                    Value::Null
                }
            }
            Self::Avg { w, .. } => w.mean().map_or(Value::Null, number_value),
            Self::StdDev { w, .. } => w.std_dev().map_or(Value::Null, number_value),
            Self::Min { v, .. } | Self::Max { v, .. } => v.map_or(Value::Null, number_value),
            Self::Percentile { p, mut values, .. } => {
                percentile(&mut values, p).map_or(Value::Null, number_value)
            }
        }
    }
}
