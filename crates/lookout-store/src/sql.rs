//! Compilation of predicate trees into parameterized SQL.
//!
//! Predicates are pushed onto a [`QueryBuilder`]: column names (already
//! resolved against the schema allow-list by `Filter::validate`) land in the
//! SQL text, values always become `$n` bind parameters — nothing from a
//! predicate value is ever interpolated into the statement.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use lookout_core::{ColumnKind, Predicate, Value};

/// Append a predicate tree as a `WHERE`-clause fragment.
pub fn push_predicate(builder: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::Eq(c, v) => push_comparison(builder, c, "=", v),
        Predicate::Neq(c, v) => push_comparison(builder, c, "!=", v),
        Predicate::Gt(c, v) => push_comparison(builder, c, ">", v),
        Predicate::Ge(c, v) => push_comparison(builder, c, ">=", v),
        Predicate::Lt(c, v) => push_comparison(builder, c, "<", v),
        Predicate::Le(c, v) => push_comparison(builder, c, "<=", v),
        Predicate::In(c, values) => {
            builder.push(c.as_str());
            builder.push(" IN (");
            let mut separated = builder.separated(", ");
            for value in values {
                push_value_separated(&mut separated, value);
            }
            builder.push(")");
        }
        Predicate::And(children) => {
            if children.is_empty() {
                builder.push("TRUE");
                return;
            }
            builder.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    builder.push(" AND ");
                }
                push_predicate(builder, child);
            }
            builder.push(")");
        }
    }
}

fn push_comparison(
    builder: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    op: &str,
    value: &Value,
) {
    builder.push(column);
    builder.push(" ");
    builder.push(op);
    builder.push(" ");
    push_value(builder, value);
}

/// Bind one scalar value as the next placeholder.
pub fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Text(s) => builder.push_bind(s.clone()),
        Value::Int(i) => builder.push_bind(*i),
        Value::Bool(b) => builder.push_bind(*b),
        Value::Time(t) => builder.push_bind(*t),
    };
}

fn push_value_separated(
    separated: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>,
    value: &Value,
) {
    match value {
        Value::Text(s) => separated.push_bind(s.clone()),
        Value::Int(i) => separated.push_bind(*i),
        Value::Bool(b) => separated.push_bind(*b),
        Value::Time(t) => separated.push_bind(*t),
    };
}

/// Bind a possibly-NULL index column, typed by its schema kind so the
/// driver sends a correctly typed NULL.
pub fn push_nullable(
    builder: &mut QueryBuilder<'_, Postgres>,
    kind: ColumnKind,
    value: &Option<Value>,
) {
    match value {
        Some(v) => push_value(builder, v),
        None => {
            match kind {
                ColumnKind::Text => builder.push_bind(None::<String>),
                ColumnKind::BigInt => builder.push_bind(None::<i64>),
                ColumnKind::Bool => builder.push_bind(None::<bool>),
                ColumnKind::Timestamp => builder.push_bind(None::<DateTime<Utc>>),
            };
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(predicate: &Predicate) -> String {
        let mut builder = QueryBuilder::new("");
        push_predicate(&mut builder, predicate);
        builder.sql().to_string()
    }

    #[test]
    fn single_comparison_binds_value() {
        assert_eq!(compile(&Predicate::eq("status", "WAITING")), "status = $1");
    }

    #[test]
    fn all_comparison_operators() {
        for (predicate, expected) in [
            (Predicate::neq("status", "WAITING"), "status != $1"),
            (Predicate::gt("ref_id", 5i64), "ref_id > $1"),
            (Predicate::ge("ref_id", 5i64), "ref_id >= $1"),
            (Predicate::lt("ref_id", 5i64), "ref_id < $1"),
            (Predicate::le("ref_id", 5i64), "ref_id <= $1"),
        ] {
            assert_eq!(compile(&predicate), expected);
        }
    }

    #[test]
    fn in_expands_one_placeholder_per_value() {
        let predicate = Predicate::in_values(
            "status",
            vec!["COMPLETED".into(), "FAILED".into(), "TIMEOUT".into()],
        );
        assert_eq!(compile(&predicate), "status IN ($1, $2, $3)");
    }

    #[test]
    fn and_parenthesizes_and_numbers_sequentially() {
        let predicate = Predicate::and(vec![
            Predicate::eq("status", "WAITING"),
            Predicate::gt("ref_id", 10i64),
            Predicate::in_values("task_type", vec!["DETECTION".into(), "REPLAY".into()]),
        ]);
        assert_eq!(
            compile(&predicate),
            "(status = $1 AND ref_id > $2 AND task_type IN ($3, $4))"
        );
    }

    #[test]
    fn nested_and_keeps_grouping() {
        let predicate = Predicate::and(vec![
            Predicate::eq("status", "RUNNING"),
            Predicate::and(vec![
                Predicate::ge("ref_id", 1i64),
                Predicate::le("ref_id", 9i64),
            ]),
        ]);
        assert_eq!(
            compile(&predicate),
            "(status = $1 AND (ref_id >= $2 AND ref_id <= $3))"
        );
    }

    #[test]
    fn empty_and_compiles_to_true() {
        assert_eq!(compile(&Predicate::and(vec![])), "TRUE");
    }

    #[test]
    fn placeholders_continue_after_existing_binds() {
        let mut builder = QueryBuilder::new("UPDATE record_payload SET version = ");
        builder.push_bind(2i32);
        builder.push(" WHERE ");
        push_predicate(&mut builder, &Predicate::eq("id", 7i64));
        assert_eq!(
            builder.sql(),
            "UPDATE record_payload SET version = $1 WHERE id = $2"
        );
    }

    #[test]
    fn nullable_none_binds_typed_null() {
        let mut builder = QueryBuilder::new("");
        push_nullable(&mut builder, ColumnKind::Timestamp, &None);
        assert_eq!(builder.sql(), "$1");
    }
}
