//! Report cost estimation and tuning hints.
//!
//! Everything here is advisory; nothing the advisor says blocks a run.

use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineLimits;
use crate::model::{FieldRef, ReportLayout, SortTarget};
use crate::registry::Registry;
use crate::sql::Dialect;

const JOIN_COST: u32 = 100;
const FILTER_COST: u32 = 10;
const AGGREGATION_COST: u32 = 50;
const GROUP_BY_COST: u32 = 30;
const COLUMN_COST: u32 = 5;

/// Joins or aggregation functions above this draw a suggestion.
const MANY_THRESHOLD: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Normal,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    HighComplexity,
    VeryHighComplexity,
    ManyJoins,
    ManyAggregations,
    NoFilters,
    NoSorting,
    UngroupedColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub message: String,
}

impl Suggestion {
    fn new(kind: SuggestionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A proposed composite index, tenant column first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSuggestion {
    pub source: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl IndexSuggestion {
    pub fn name(&self) -> String {
        format!("idx_{}_{}", self.table, self.columns.join("_"))
    }

    /// `CREATE INDEX` statement for `dialect`.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        dialect.create_index(&self.name(), &self.table, &self.columns)
    }
}

/// Full advisor output for one layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub estimated_cost: u32,
    pub complexity: Complexity,
    pub suggestions: Vec<Suggestion>,
    pub indexes: Vec<IndexSuggestion>,
    pub used_relations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueryAdvisor {
    registry: Arc<Registry>,
    limits: EngineLimits,
}

impl QueryAdvisor {
    pub fn new(registry: Arc<Registry>, limits: EngineLimits) -> Self {
        Self { registry, limits }
    }

    pub fn analyze(&self, layout: &ReportLayout) -> Analysis {
        let estimated_cost = self.estimate_cost(layout);
        Analysis {
            estimated_cost,
            complexity: self.complexity(estimated_cost),
            suggestions: self.suggestions(layout),
            indexes: self.suggest_indexes(layout),
            used_relations: self.detect_used_relations(layout),
        }
    }

    /// Weighted count of the parts that make a report expensive.
    pub fn estimate_cost(&self, layout: &ReportLayout) -> u32 {
        let weighted = |n: usize, weight: u32| u32::try_from(n).unwrap_or(u32::MAX).saturating_mul(weight);
        weighted(layout.data_sources.joins.len(), JOIN_COST)
            .saturating_add(weighted(layout.filters.len(), FILTER_COST))
            .saturating_add(weighted(layout.aggregations.functions.len(), AGGREGATION_COST))
            .saturating_add(weighted(layout.aggregations.group_by.len(), GROUP_BY_COST))
            .saturating_add(weighted(layout.columns.len(), COLUMN_COST))
    }

    pub fn complexity(&self, cost: u32) -> Complexity {
        if cost > self.limits.very_high_cost_threshold {
            Complexity::VeryHigh
        } else if cost > self.limits.high_cost_threshold {
            Complexity::High
        } else {
            Complexity::Normal
        }
    }

    pub fn suggestions(&self, layout: &ReportLayout) -> Vec<Suggestion> {
        let mut out = Vec::new();

        let cost = self.estimate_cost(layout);
        match self.complexity(cost) {
            Complexity::VeryHigh => out.push(Suggestion::new(
                SuggestionKind::VeryHighComplexity,
                format!(
                    "Very high complexity (cost {}): split the report or narrow it with filters",
                    cost
                ),
            )),
            Complexity::High => out.push(Suggestion::new(
                SuggestionKind::HighComplexity,
                format!("High complexity (cost {}): consider fewer joins or columns", cost),
            )),
            Complexity::Normal => {}
        }

        let joins = layout.data_sources.joins.len();
        if joins > MANY_THRESHOLD {
            out.push(Suggestion::new(
                SuggestionKind::ManyJoins,
                format!("{} joins: consider splitting into several reports", joins),
            ));
        }

        let functions = layout.aggregations.functions.len();
        if functions > MANY_THRESHOLD {
            out.push(Suggestion::new(
                SuggestionKind::ManyAggregations,
                format!("{} aggregation functions: consider fewer summaries", functions),
            ));
        }

        if layout.filters.is_empty() {
            out.push(Suggestion::new(
                SuggestionKind::NoFilters,
                "No filters: every run reads all of the tenant's rows",
            ));
        }

        if layout.sorting.is_empty() {
            out.push(Suggestion::new(
                SuggestionKind::NoSorting,
                "No sorting: row order is not guaranteed between runs",
            ));
        }

        if layout.is_aggregated() {
            let grouped = &layout.aggregations.group_by;
            for column in &layout.columns {
                if column.aggregation.is_some() {
                    continue;
                }
                let fields = column.expr.fields();
                if fields.is_empty() || fields.iter().all(|f| grouped.contains(f)) {
                    continue;
                }
                out.push(Suggestion::new(
                    SuggestionKind::UngroupedColumn,
                    format!(
                        "Column '{}' is neither grouped nor aggregated; its value is arbitrary per group",
                        column.label
                    ),
                ));
            }
        }

        out
    }

    /// `(tenant_column, field)` indexes for fields used to filter, join,
    /// sort or group.
    pub fn suggest_indexes(&self, layout: &ReportLayout) -> Vec<IndexSuggestion> {
        let mut fields: Vec<&FieldRef> = Vec::new();
        fields.extend(layout.filters.iter().map(|slot| &slot.field));
        for join in &layout.data_sources.joins {
            fields.push(&join.on.0);
            fields.push(&join.on.1);
        }
        fields.extend(layout.sorting.iter().filter_map(|sort| match &sort.target {
            SortTarget::Field(field) => Some(field),
            SortTarget::Alias(_) => None,
        }));
        fields.extend(layout.aggregations.group_by.iter());

        let mut out: Vec<IndexSuggestion> = Vec::new();
        for field in fields {
            let Some(source) = self.registry.get(&field.source) else {
                continue;
            };
            let Some(meta) = source.field(&field.field) else {
                continue;
            };
            let column = meta.column_name();
            if column == source.tenant_column {
                continue;
            }
            let suggestion = IndexSuggestion {
                source: source.key.clone(),
                table: source.table.clone(),
                columns: vec![source.tenant_column.clone(), column.to_string()],
            };
            if !out.contains(&suggestion) {
                out.push(suggestion);
            }
        }
        out
    }

    /// Relation keys of the primary source whose target the report joins
    /// or references.
    pub fn detect_used_relations(&self, layout: &ReportLayout) -> Vec<String> {
        let referenced = layout.referenced_sources();
        let joined: Vec<&str> = layout
            .data_sources
            .joins
            .iter()
            .map(|j| j.table.as_str())
            .collect();

        let Some(relations) = self.registry.relations(&layout.data_sources.primary) else {
            return Vec::new();
        };
        relations
            .values()
            .filter(|rel| {
                joined.contains(&rel.target.as_str()) || referenced.contains(rel.target.as_str())
            })
            .map(|rel| rel.key.clone())
            .collect()
    }
}
