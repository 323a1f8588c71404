//! Column comparison predicates and list filters.
//!
//! A [`Predicate`] is a tree of `(column, operator, value)` comparisons
//! composed with `AND`. A [`Filter`] adds a target record type and optional
//! `limit`/`offset`. Predicates reference index-table columns by name; the
//! store validates every referenced column against the target type's index
//! schema before compiling anything to SQL, so an unknown column is rejected
//! up front instead of silently matching nothing.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::RecordType;
use crate::registry::IndexSchema;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unknown column '{column}' for table '{table}'")]
    UnknownColumn { column: String, table: String },

    #[error("limit must be >= 0, got {0}")]
    NegativeLimit(i64),

    #[error("offset must be >= 0, got {0}")]
    NegativeOffset(i64),

    #[error("offset is only valid together with a limit")]
    OffsetWithoutLimit,

    #[error("IN predicate on column '{0}' has no values")]
    EmptyIn(String),

    #[error("unknown operator token '{0}'")]
    UnknownOperator(String),
}

// ── Values ──────────────────────────────────────────────────────────

/// A scalar comparison value. Always carried as a bound query parameter,
/// never interpolated into SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

// ── Operators ───────────────────────────────────────────────────────

/// Comparison operator, with the wire tokens used by the external query
/// surface (`eq`, `neq`, `gt`, `gte`, `lt`, `lte`, `in`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

impl Operator {
    pub fn token(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Ge => "gte",
            Operator::Lt => "lt",
            Operator::Le => "lte",
            Operator::In => "in",
        }
    }

    /// SQL comparison symbol. `In` expands to a placeholder list instead.
    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::In => "IN",
        }
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Operator::Eq),
            "neq" => Ok(Operator::Neq),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Ge),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Le),
            "in" => Ok(Operator::In),
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

// ── Predicates ──────────────────────────────────────────────────────

/// A tree of column comparisons joined by `AND`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    In(String, Vec<Value>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.into(), value.into())
    }

    pub fn neq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Neq(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Gt(column.into(), value.into())
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ge(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Lt(column.into(), value.into())
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Le(column.into(), value.into())
    }

    pub fn in_values(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In(column.into(), values)
    }

    pub fn and(children: Vec<Predicate>) -> Self {
        Predicate::And(children)
    }

    /// Build a leaf comparison from an operator token pair, as submitted by
    /// the external query surface.
    pub fn compare(
        column: impl Into<String>,
        op: Operator,
        values: Vec<Value>,
    ) -> Result<Self, FilterError> {
        let column = column.into();
        match op {
            Operator::In => {
                if values.is_empty() {
                    return Err(FilterError::EmptyIn(column));
                }
                Ok(Predicate::In(column, values))
            }
            single => {
                let value = values
                    .into_iter()
                    .next()
                    .ok_or_else(|| FilterError::EmptyIn(column.clone()))?;
                Ok(match single {
                    Operator::Eq => Predicate::Eq(column, value),
                    Operator::Neq => Predicate::Neq(column, value),
                    Operator::Gt => Predicate::Gt(column, value),
                    Operator::Ge => Predicate::Ge(column, value),
                    Operator::Lt => Predicate::Lt(column, value),
                    Operator::Le => Predicate::Le(column, value),
                    Operator::In => unreachable!("handled above"),
                })
            }
        }
    }

    /// Every column name referenced anywhere in the tree.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Eq(c, _)
            | Predicate::Neq(c, _)
            | Predicate::Gt(c, _)
            | Predicate::Ge(c, _)
            | Predicate::Lt(c, _)
            | Predicate::Le(c, _)
            | Predicate::In(c, _) => out.push(c),
            Predicate::And(children) => {
                for child in children {
                    child.collect_columns(out);
                }
            }
        }
    }

    /// Validate the tree against a column allow-list: every referenced
    /// column must be present, and `IN` lists must be non-empty.
    pub fn validate(&self, table: &str, allowed: &[&str]) -> Result<(), FilterError> {
        match self {
            Predicate::In(c, values) if values.is_empty() => {
                Err(FilterError::EmptyIn(c.clone()))
            }
            Predicate::Eq(c, _)
            | Predicate::Neq(c, _)
            | Predicate::Gt(c, _)
            | Predicate::Ge(c, _)
            | Predicate::Lt(c, _)
            | Predicate::Le(c, _)
            | Predicate::In(c, _) => {
                if allowed.contains(&c.as_str()) {
                    Ok(())
                } else {
                    Err(FilterError::UnknownColumn {
                        column: c.clone(),
                        table: table.to_string(),
                    })
                }
            }
            Predicate::And(children) => {
                for child in children {
                    child.validate(table, allowed)?;
                }
                Ok(())
            }
        }
    }
}

// ── Filters ─────────────────────────────────────────────────────────

/// A predicate plus pagination, targeting one record type.
#[derive(Debug, Clone)]
pub struct Filter {
    pub record_type: RecordType,
    pub predicate: Predicate,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Filter {
    pub fn new(record_type: RecordType, predicate: Predicate) -> Self {
        Self {
            record_type,
            predicate,
            limit: None,
            offset: None,
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Check pagination bounds and resolve every predicate column against
    /// the index schema. Runs before any SQL is built.
    pub fn validate(&self, schema: &IndexSchema) -> Result<(), FilterError> {
        if let Some(limit) = self.limit {
            if limit < 0 {
                return Err(FilterError::NegativeLimit(limit));
            }
        }
        if let Some(offset) = self.offset {
            if self.limit.is_none() {
                return Err(FilterError::OffsetWithoutLimit);
            }
            if offset < 0 {
                return Err(FilterError::NegativeOffset(offset));
            }
        }
        self.predicate
            .validate(schema.table, &schema.allowed_columns())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
