//! Typed report layout.
//!
//! Built by [`crate::validation::ConfigValidator::build`] from a draft once
//! every check has passed; everything downstream (compiler, advisor,
//! engine) works on these types only.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Field references
// ============================================================================

/// A fully-qualified `source.field` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldRef {
    pub source: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(source: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            field: field.into(),
        }
    }

    /// Parse `source.field`. Both halves must be non-empty and there must be
    /// exactly one dot.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (source, field) = full_name.split_once('.')?;
        if source.is_empty() || field.is_empty() || field.contains('.') {
            return None;
        }
        Some(Self::new(source, field))
    }

    /// `source.field`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.source, self.field)
    }

    /// Default output alias: `source_field`.
    pub fn default_alias(&self) -> String {
        format!("{}_{}", self.source, self.field)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.field)
    }
}

impl TryFrom<String> for FieldRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FieldRef::parse(&value).ok_or_else(|| format!("'{}' is not a source.field name", value))
    }
}

impl From<FieldRef> for String {
    fn from(value: FieldRef) -> Self {
        value.full_name()
    }
}

// ============================================================================
// Data sources and joins
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

impl JoinKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inner" => Some(JoinKind::Inner),
            "left" => Some(JoinKind::Left),
            _ => None,
        }
    }
}

/// A join to another registry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Target source key.
    pub table: String,
    #[serde(rename = "type")]
    pub join_type: JoinKind,
    /// Exactly two fully-qualified fields compared for equality.
    pub on: (FieldRef, FieldRef),
}

/// Primary source plus ordered joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub primary: String,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
}

impl SourceSpec {
    /// Source keys visible to columns, filters and sorting.
    pub fn in_scope(&self) -> Vec<&str> {
        std::iter::once(self.primary.as_str())
            .chain(self.joins.iter().map(|j| j.table.as_str()))
            .collect()
    }
}

// ============================================================================
// Columns
// ============================================================================

/// Display hint applied to cell values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnFormat {
    #[default]
    Text,
    Number,
    Currency,
    Percent,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
}

impl ColumnFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(ColumnFormat::Text),
            "number" => Some(ColumnFormat::Number),
            "currency" => Some(ColumnFormat::Currency),
            "percent" => Some(ColumnFormat::Percent),
            "date" => Some(ColumnFormat::Date),
            "datetime" => Some(ColumnFormat::DateTime),
            _ => None,
        }
    }
}

/// Aggregate functions reports may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Some(AggregateFunction::Sum),
            "count" => Some(AggregateFunction::Count),
            "avg" => Some(AggregateFunction::Avg),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// Whitelisted scalar functions for derived columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarFunction {
    Upper,
    Lower,
    Coalesce,
    Round,
    Abs,
    Length,
    Trim,
    Substr,
}

impl ScalarFunction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upper" => Some(ScalarFunction::Upper),
            "lower" => Some(ScalarFunction::Lower),
            "coalesce" => Some(ScalarFunction::Coalesce),
            "round" => Some(ScalarFunction::Round),
            "abs" => Some(ScalarFunction::Abs),
            "length" => Some(ScalarFunction::Length),
            "trim" => Some(ScalarFunction::Trim),
            "substr" => Some(ScalarFunction::Substr),
            _ => None,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            ScalarFunction::Upper => "UPPER",
            ScalarFunction::Lower => "LOWER",
            ScalarFunction::Coalesce => "COALESCE",
            ScalarFunction::Round => "ROUND",
            ScalarFunction::Abs => "ABS",
            ScalarFunction::Length => "LENGTH",
            ScalarFunction::Trim => "TRIM",
            ScalarFunction::Substr => "SUBSTR",
        }
    }

    /// Accepted argument counts (min, max).
    pub fn arity(&self) -> (usize, usize) {
        match self {
            ScalarFunction::Upper
            | ScalarFunction::Lower
            | ScalarFunction::Abs
            | ScalarFunction::Length
            | ScalarFunction::Trim => (1, 1),
            ScalarFunction::Round => (1, 2),
            ScalarFunction::Substr => (2, 3),
            ScalarFunction::Coalesce => (2, 8),
        }
    }
}

/// Column value expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnExpr {
    Field(FieldRef),
    /// JSON scalar, bound as a parameter.
    Literal(Value),
    Call {
        function: ScalarFunction,
        args: Vec<ColumnExpr>,
    },
}

impl ColumnExpr {
    /// Every field referenced anywhere in the expression.
    pub fn fields(&self) -> Vec<&FieldRef> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a FieldRef>) {
        match self {
            ColumnExpr::Field(f) => out.push(f),
            ColumnExpr::Literal(_) => {}
            ColumnExpr::Call { args, .. } => {
                for arg in args {
                    arg.collect_fields(out);
                }
            }
        }
    }

    /// The field, when this is a plain field reference.
    pub fn as_field(&self) -> Option<&FieldRef> {
        match self {
            ColumnExpr::Field(f) => Some(f),
            _ => None,
        }
    }
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub expr: ColumnExpr,
    pub label: String,
    #[serde(default)]
    pub format: ColumnFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregateFunction>,
    /// Output alias; always set once built.
    pub alias: String,
}

// ============================================================================
// Filters
// ============================================================================

/// Runtime filter slot kind. Fixes the operator applied at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Text,
    Select,
    Number,
    Date,
    DateRange,
    Multiselect,
}

impl FilterType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Some(FilterType::Text),
            "select" => Some(FilterType::Select),
            "number" => Some(FilterType::Number),
            "date" => Some(FilterType::Date),
            "date_range" => Some(FilterType::DateRange),
            "multiselect" => Some(FilterType::Multiselect),
            _ => None,
        }
    }
}

/// A declared runtime filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSlot {
    pub field: FieldRef,
    pub label: String,
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    #[serde(default)]
    pub required: bool,
    /// Choices offered for select/multiselect. Advisory only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
}

// ============================================================================
// Aggregations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub field: FieldRef,
    pub function: AggregateFunction,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(default)]
    pub group_by: Vec<FieldRef>,
    #[serde(default)]
    pub functions: Vec<Aggregation>,
}

impl AggregationSpec {
    pub fn is_empty(&self) -> bool {
        self.group_by.is_empty() && self.functions.is_empty()
    }
}

// ============================================================================
// Sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// What a sort entry orders by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortTarget {
    Field(FieldRef),
    /// Output alias of a column or aggregation.
    Alias(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub target: SortTarget,
    #[serde(default)]
    pub direction: SortDirection,
}

// ============================================================================
// Layout
// ============================================================================

/// Validated, typed report layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportLayout {
    pub data_sources: SourceSpec,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub filters: Vec<FilterSlot>,
    #[serde(default)]
    pub aggregations: AggregationSpec,
    #[serde(default)]
    pub sorting: Vec<SortSpec>,
}

impl ReportLayout {
    /// Whether the compiled query groups rows.
    pub fn is_aggregated(&self) -> bool {
        !self.aggregations.functions.is_empty()
            || !self.aggregations.group_by.is_empty()
            || self.columns.iter().any(|c| c.aggregation.is_some())
    }

    /// Filter slot declared for `full_name`, if any.
    pub fn filter_slot(&self, full_name: &str) -> Option<&FilterSlot> {
        self.filters
            .iter()
            .find(|slot| slot.field.full_name() == full_name)
    }

    /// Output aliases: columns first, then aggregations no column projects.
    pub fn output_aliases(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for alias in self
            .columns
            .iter()
            .map(|c| c.alias.as_str())
            .chain(self.aggregations.functions.iter().map(|a| a.alias.as_str()))
        {
            if seen.insert(alias) {
                out.push(alias);
            }
        }
        out
    }

    /// Every source key referenced by any field anywhere in the layout.
    pub fn referenced_sources(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for column in &self.columns {
            for f in column.expr.fields() {
                out.insert(f.source.as_str());
            }
        }
        for slot in &self.filters {
            out.insert(slot.field.source.as_str());
        }
        for f in &self.aggregations.group_by {
            out.insert(f.source.as_str());
        }
        for agg in &self.aggregations.functions {
            out.insert(agg.field.source.as_str());
        }
        for sort in &self.sorting {
            if let SortTarget::Field(f) = &sort.target {
                out.insert(f.source.as_str());
            }
        }
        out
    }
}
