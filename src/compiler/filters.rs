//! Runtime filter application.
//!
//! Users only ever supply values; the operator comes from the declared
//! filter slot. Values for undeclared fields, and values whose shape does
//! not fit the slot, are dropped.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use super::{CompiledQuery, QueryCompiler};
use crate::model::{FilterSlot, FilterType, ReportLayout};
use crate::registry::FieldType;
use crate::sql::{lower, param, table_col, Expr, ExprExt, Literal};

const LIKE_ESCAPE: char = '\\';

impl QueryCompiler {
    /// AND one predicate per supplied value onto `compiled`.
    ///
    /// `values` is keyed by field full name (`source.field`). The tenant
    /// predicate stays in place; these only ever narrow the result.
    pub fn apply_user_filters(
        &self,
        compiled: CompiledQuery,
        values: &BTreeMap<String, Value>,
        layout: &ReportLayout,
    ) -> CompiledQuery {
        let mut compiled = compiled;
        for (name, value) in values {
            let Some(slot) = layout.filter_slot(name) else {
                debug!(filter = %name, "ignoring value for undeclared filter");
                continue;
            };
            let Some(meta) = self.registry.field(&slot.field.source, &slot.field.field) else {
                debug!(filter = %name, "ignoring filter on unresolved field");
                continue;
            };
            if !compiled.includes(&slot.field.source) {
                debug!(filter = %name, "ignoring filter outside the joined sources");
                continue;
            }

            let column = table_col(&slot.field.source, meta.column_name());
            match slot_predicate(slot, meta.data_type, column, value) {
                Some(predicate) => compiled = compiled.and_filter(predicate),
                None => debug!(filter = %name, "ignoring value that does not fit the filter"),
            }
        }
        compiled
    }
}

/// Predicate for one slot, or `None` when the value is absent or unusable.
fn slot_predicate(
    slot: &FilterSlot,
    data_type: FieldType,
    column: Expr,
    value: &Value,
) -> Option<Expr> {
    if value.is_null() {
        return slot.required.then(|| column.is_null());
    }
    // Empty form inputs count as no value
    if value.as_str().is_some_and(|s| s.trim().is_empty()) {
        return None;
    }

    match slot.filter_type {
        FilterType::Text => {
            let needle = scalar_text(value)?;
            let pattern = format!("%{}%", escape_like(&needle));
            Some(lower(column).like_escape(lower(param(pattern)), LIKE_ESCAPE))
        }
        FilterType::Number => Some(column.eq(Expr::Param(numeric_literal(value)?))),
        FilterType::Select | FilterType::Date => {
            Some(column.eq(Expr::Param(scalar_literal(value)?)))
        }
        FilterType::DateRange => date_range(column, value, data_type),
        FilterType::Multiselect => {
            let items = match value {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                scalar => vec![scalar],
            };
            let values = items
                .into_iter()
                .map(|v| scalar_literal(v).map(Expr::Param))
                .collect::<Option<Vec<_>>>()?;
            // An empty list renders as `1 = 0` and matches nothing
            Some(column.in_list(values))
        }
    }
}

/// Inclusive range over `{from, to}` or `[from, to]`; either side may be
/// missing.
fn date_range(column: Expr, value: &Value, data_type: FieldType) -> Option<Expr> {
    let (from, to) = match value {
        Value::Object(obj) => (obj.get("from"), obj.get("to")),
        Value::Array(items) if items.len() == 2 => (items.first(), items.get(1)),
        _ => return None,
    };
    let from = from.and_then(date_bound);
    let to = to.and_then(date_bound).map(|to| {
        // A date-only upper bound on a timestamp covers the whole day
        if data_type == FieldType::DateTime && is_date_only(&to) {
            format!("{} 23:59:59", to)
        } else {
            to
        }
    });

    match (from, to) {
        (Some(from), Some(to)) => Some(column.between(param(from), param(to))),
        (Some(from), None) => Some(column.gte(param(from))),
        (None, Some(to)) => Some(column.lte(param(to))),
        (None, None) => None,
    }
}

fn date_bound(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_date_only(s: &str) -> bool {
    s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_') || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Scalar JSON value as a bindable literal. Null, arrays and objects are
/// rejected.
fn scalar_literal(value: &Value) -> Option<Literal> {
    match value {
        Value::Null => None,
        other => Literal::from_json(other),
    }
}

/// Like [`scalar_literal`], but numeric strings bind as numbers.
fn numeric_literal(value: &Value) -> Option<Literal> {
    if let Some(s) = value.as_str() {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Some(Literal::Int(n));
        }
        if let Ok(f) = s.parse::<f64>() {
            return f.is_finite().then_some(Literal::Float(f));
        }
        return None;
    }
    scalar_literal(value)
}
