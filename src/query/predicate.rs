//! Filter predicates over pipeline rows.

use std::cmp::Ordering;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::query::record::{compare_values, value_text, values_equal, Fields};

/// Declarative predicate as it appears in a pipeline descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Ge { field: String, value: Value },
    Lt { field: String, value: Value },
    Le { field: String, value: Value },
    /// Case-insensitive unless `case_sensitive` is set.
    Contains {
        field: String,
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Matches { field: String, pattern: String },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
            case_sensitive: false,
        }
    }

    pub fn and(all: Vec<Predicate>) -> Self {
        Self::And { all }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            predicate: Box::new(self),
        }
    }

    /// Every field this predicate reads.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Eq { field, .. }
            | Self::Ne { field, .. }
            | Self::Gt { field, .. }
            | Self::Ge { field, .. }
            | Self::Lt { field, .. }
            | Self::Le { field, .. }
            | Self::Contains { field, .. }
            | Self::Matches { field, .. }
            | Self::In { field, .. }
            | Self::Exists { field } => out.push(field),
            Self::And { all: ps } | Self::Or { any: ps } => {
                for p in ps {
                    p.collect_fields(out);
                }
            }
            Self::Not { predicate } => predicate.collect_fields(out),
        }
    }

    /// Entities a top-level filter pins, for the store's entity index.
    pub fn entity_hint(&self) -> Option<Vec<String>> {
        match self {
            Self::Eq { field, value } if field == "entity" => {
                value.as_str().map(|s| vec![s.to_string()])
            }
            Self::In { field, values } if field == "entity" => values
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            Self::And { all } => all.iter().find_map(Predicate::entity_hint),
            _ => None,
        }
    }

    pub fn compile(&self) -> EngineResult<CompiledPredicate> {
        Ok(match self {
            Self::Eq { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Eq, value.clone()),
            Self::Ne { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Ne, value.clone()),
            Self::Gt { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Gt, value.clone()),
            Self::Ge { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Ge, value.clone()),
            Self::Lt { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Lt, value.clone()),
            Self::Le { field, value } => CompiledPredicate::Cmp(field.clone(), CmpOp::Le, value.clone()),
            Self::Contains {
                field,
                value,
                case_sensitive,
            } => CompiledPredicate::Contains {
                field: field.clone(),
                needle: if *case_sensitive {
                    value.clone()
                } else {
                    value.to_lowercase()
                },
                case_sensitive: *case_sensitive,
            },
            Self::Matches { field, pattern } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    EngineError::validation(format!("invalid pattern '{pattern}': {e}"))
                })?;
                CompiledPredicate::Matches(field.clone(), regex)
            }
            Self::In { field, values } => CompiledPredicate::In(field.clone(), values.clone()),
            Self::Exists { field } => CompiledPredicate::Exists(field.clone()),
            Self::And { all } => CompiledPredicate::And(
                all.iter().map(Predicate::compile).collect::<EngineResult<_>>()?,
            ),
            Self::Or { any } => CompiledPredicate::Or(
                any.iter().map(Predicate::compile).collect::<EngineResult<_>>()?,
            ),
            Self::Not { predicate } => CompiledPredicate::Not(Box::new(predicate.compile()?)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A predicate with its regular expressions compiled.
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Cmp(String, CmpOp, Value),
    Contains {
        field: String,
        needle: String,
        case_sensitive: bool,
    },
    Matches(String, Regex),
    In(String, Vec<Value>),
    Exists(String),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    pub fn eval<F: Fields + ?Sized>(&self, row: &F) -> bool {
        match self {
            Self::Cmp(field, op, rhs) => {
                let lhs = row.field(field);
                match op {
                    CmpOp::Eq => values_equal(&lhs, rhs),
                    CmpOp::Ne => !values_equal(&lhs, rhs),
                    CmpOp::Gt => compare_values(&lhs, rhs) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(
                        compare_values(&lhs, rhs),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CmpOp::Lt => compare_values(&lhs, rhs) == Some(Ordering::Less),
                    CmpOp::Le => matches!(
                        compare_values(&lhs, rhs),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
            Self::Contains {
                field,
                needle,
                case_sensitive,
            } => {
                let hay = value_text(&row.field(field));
                if *case_sensitive {
                    hay.contains(needle.as_str())
                } else {
                    hay.to_lowercase().contains(needle.as_str())
                }
            }
            Self::Matches(field, regex) => match row.field(field) {
                Value::Null => false,
                v => regex.is_match(&value_text(&v)),
            },
            Self::In(field, values) => {
                let v = row.field(field);
                values.iter().any(|c| values_equal(&v, c))
            }
            Self::Exists(field) => !row.field(field).is_null(),
            Self::And(ps) => ps.iter().all(|p| p.eval(row)),
            Self::Or(ps) => ps.iter().any(|p| p.eval(row)),
            Self::Not(p) => !p.eval(row),
        }
    }
}
