//! Validation of draft report configurations.
//!
//! [`ConfigValidator`] checks a [`DraftConfig`] against the registry and the
//! configured [`EngineLimits`] and is the only place a typed
//! [`ReportLayout`] gets built. Validation is pure: the same draft always
//! yields the same errors.
//!
//! Sections are checked in a fixed order (metadata, data sources, columns,
//! aggregations, filters, sorting). Problems inside a section are collected;
//! a section with the wrong shape stops the walk, since later sections can
//! no longer be resolved against it.

mod error;

pub use error::ConfigError;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::EngineLimits;
use crate::model::{
    AggregateFunction, Aggregation, AggregationSpec, Column, ColumnExpr, ColumnFormat, DraftConfig,
    FieldRef, FilterSlot, FilterType, JoinKind, JoinSpec, ReportLayout, ScalarFunction,
    SortDirection, SortSpec, SortTarget, SourceSpec,
};
use crate::registry::{is_identifier, FieldMetadata, FieldType, Registry};

/// Nesting allowed inside a derived column expression.
const MAX_EXPRESSION_DEPTH: usize = 8;

/// Validates drafts and builds typed layouts.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    registry: Arc<Registry>,
    limits: EngineLimits,
}

impl ConfigValidator {
    pub fn new(registry: Arc<Registry>, limits: EngineLimits) -> Self {
        Self { registry, limits }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Every problem in `draft`. Empty means valid.
    ///
    /// With `require_full_metadata`, name and category must be present too.
    pub fn validate(&self, draft: &DraftConfig, require_full_metadata: bool) -> Vec<ConfigError> {
        let mut walk = Walk::new(&self.registry, &self.limits);
        walk.run(draft, require_full_metadata);
        walk.errors
    }

    /// Build the typed layout, or return every problem found.
    pub fn build(
        &self,
        draft: &DraftConfig,
        require_full_metadata: bool,
    ) -> Result<ReportLayout, Vec<ConfigError>> {
        let mut walk = Walk::new(&self.registry, &self.limits);
        match walk.run(draft, require_full_metadata) {
            Some(layout) if walk.errors.is_empty() => Ok(layout),
            _ => Err(walk.errors),
        }
    }
}

// ============================================================================
// Walk
// ============================================================================

/// A section had the wrong shape; stop.
struct Malformed;

type Step<T> = Result<T, Malformed>;

struct Walk<'a> {
    registry: &'a Registry,
    limits: &'a EngineLimits,
    errors: Vec<ConfigError>,
    /// Source keys columns, filters and sorting may reference.
    scope: Vec<String>,
}

impl<'a> Walk<'a> {
    fn new(registry: &'a Registry, limits: &'a EngineLimits) -> Self {
        Self {
            registry,
            limits,
            errors: Vec::new(),
            scope: Vec::new(),
        }
    }

    fn run(&mut self, draft: &DraftConfig, require_full_metadata: bool) -> Option<ReportLayout> {
        if require_full_metadata {
            self.metadata(draft);
        }

        let data_sources = match self.data_sources(&draft.data_sources) {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                // Nothing resolves without a primary source, but limits and
                // section coupling are still checked.
                self.unscoped(draft);
                return None;
            }
            Err(Malformed) => return None,
        };

        // Columns may name aggregation aliases, so aggregations are resolved
        // first but their errors are reported after the column errors.
        let earlier = std::mem::take(&mut self.errors);
        let aggregations = self.aggregations(&draft.aggregations);
        let aggregation_errors = std::mem::replace(&mut self.errors, earlier);

        let functions = match &aggregations {
            Ok(spec) => spec.functions.as_slice(),
            Err(_) => &[],
        };
        let columns = self.columns(&draft.columns, functions);
        self.errors.extend(aggregation_errors);

        let (Ok(columns), Ok(aggregations)) = (columns, aggregations) else {
            return None;
        };

        let filters = self.filters(&draft.filters).ok()?;

        let aliases: BTreeSet<&str> = columns
            .iter()
            .map(|c| c.alias.as_str())
            .chain(aggregations.functions.iter().map(|a| a.alias.as_str()))
            .collect();
        let sorting = self.sorting(&draft.sorting, &aliases).ok()?;

        if !self.errors.is_empty() {
            return None;
        }

        Some(ReportLayout {
            data_sources,
            columns,
            filters,
            aggregations,
            sorting,
        })
    }

    /// Section counts and the group-by coupling, which need no registry.
    fn unscoped(&mut self, draft: &DraftConfig) {
        if let Ok(items) = self.list(Some(&draft.columns), "columns", "a list of columns") {
            if items.is_empty() {
                self.errors.push(ConfigError::NoColumns);
            }
            self.too_many("columns", items.len(), self.limits.max_columns);
        }

        match &draft.aggregations {
            Value::Null => {}
            Value::Object(obj) => {
                let groups = self.list(
                    obj.get("group_by"),
                    "aggregations.group_by",
                    "a list of fields",
                );
                let functions = self.list(
                    obj.get("functions"),
                    "aggregations.functions",
                    "a list of aggregation functions",
                );
                if let Ok(functions) = functions {
                    self.too_many("aggregations", functions.len(), self.limits.max_aggregations);
                    if groups.is_ok_and(|g| !g.is_empty()) && functions.is_empty() {
                        self.errors.push(ConfigError::GroupByWithoutAggregations);
                    }
                }
            }
            _ => self.errors.push(ConfigError::Malformed {
                path: "aggregations".into(),
                expected: "an object with group_by and functions",
            }),
        }

        if let Ok(items) = self.list(Some(&draft.filters), "filters", "a list of filters") {
            self.too_many("filters", items.len(), self.limits.max_filters);
        }
    }

    fn too_many(&mut self, section: &'static str, count: usize, max: usize) {
        if count > max {
            self.errors.push(ConfigError::TooMany {
                section,
                count,
                max,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------------

    fn metadata(&mut self, draft: &DraftConfig) {
        if draft.name.as_deref().map(str::trim).is_none_or(str::is_empty) {
            self.errors
                .push(ConfigError::MissingMetadata { field: "name" });
        }
        if draft
            .category
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
        {
            self.errors
                .push(ConfigError::MissingMetadata { field: "category" });
        }
    }

    // ------------------------------------------------------------------------
    // Data sources and joins
    // ------------------------------------------------------------------------

    fn data_sources(&mut self, value: &Value) -> Step<Option<SourceSpec>> {
        let Some(obj) = value.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path: "data_sources".into(),
                expected: "an object with a primary source",
            });
            return Err(Malformed);
        };

        let primary = match non_empty_str(obj, "primary") {
            None => {
                self.errors.push(ConfigError::MissingValue {
                    path: "data_sources".into(),
                    key: "primary",
                });
                None
            }
            Some(key) if !self.registry.is_valid_source(key) => {
                self.errors.push(ConfigError::UnknownSource {
                    path: "data_sources.primary".into(),
                    source: key.to_string(),
                });
                None
            }
            Some(key) => Some(key.to_string()),
        };

        let items = self.list(obj.get("joins"), "data_sources.joins", "a list of joins")?;
        self.too_many("joins", items.len(), self.limits.max_joins);
        let Some(primary) = primary else {
            return Ok(None);
        };

        self.scope.push(primary.clone());
        let mut joins = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if let Some(join) = self.join(&format!("joins[{}]", i), item) {
                joins.push(join);
            }
        }

        Ok(Some(SourceSpec { primary, joins }))
    }

    fn join(&mut self, path: &str, item: &Value) -> Option<JoinSpec> {
        let Some(obj) = item.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path: path.to_string(),
                expected: "a join object",
            });
            return None;
        };

        let Some(table) = non_empty_str(obj, "table") else {
            self.errors.push(ConfigError::MissingValue {
                path: path.to_string(),
                key: "table",
            });
            return None;
        };
        if !self.registry.is_valid_source(table) {
            self.errors.push(ConfigError::UnknownSource {
                path: path.to_string(),
                source: table.to_string(),
            });
            return None;
        }
        if self.in_scope(table) {
            self.errors.push(ConfigError::DuplicateJoin {
                path: path.to_string(),
                table: table.to_string(),
            });
            return None;
        }
        // The joined table is visible to its own condition and everything after.
        self.scope.push(table.to_string());

        let before = self.errors.len();
        let join_type = match obj.get("type") {
            None | Some(Value::Null) => JoinKind::Inner,
            Some(v) => match v.as_str().and_then(JoinKind::parse) {
                Some(kind) => kind,
                None => {
                    self.invalid(path, "join type", v);
                    JoinKind::Inner
                }
            },
        };

        let on = match obj.get("on") {
            None | Some(Value::Null) => self.default_condition(path, table),
            Some(v) => self.join_condition(path, v),
        };

        if self.errors.len() > before {
            return None;
        }
        Some(JoinSpec {
            table: table.to_string(),
            join_type,
            on: on?,
        })
    }

    /// Condition taken from a declared relation between `table` and a source
    /// already in scope.
    fn default_condition(&mut self, path: &str, table: &str) -> Option<(FieldRef, FieldRef)> {
        let registry = self.registry;
        let earlier = self.scope.iter().filter(|s| s.as_str() != table);

        for source in earlier.clone() {
            let relations = registry.relations(source).into_iter().flat_map(|r| r.values());
            for rel in relations.filter(|r| r.target == table) {
                if let (Some(local), Some(foreign)) = (&rel.local_field, &rel.foreign_field) {
                    return Some((
                        FieldRef::new(source.as_str(), local.as_str()),
                        FieldRef::new(table, foreign.as_str()),
                    ));
                }
            }
        }

        let relations = registry.relations(table).into_iter().flat_map(|r| r.values());
        for rel in relations {
            if !earlier.clone().any(|s| *s == rel.target) {
                continue;
            }
            if let (Some(local), Some(foreign)) = (&rel.local_field, &rel.foreign_field) {
                return Some((
                    FieldRef::new(table, local.as_str()),
                    FieldRef::new(rel.target.as_str(), foreign.as_str()),
                ));
            }
        }

        self.errors.push(ConfigError::MissingValue {
            path: path.to_string(),
            key: "on",
        });
        None
    }

    fn join_condition(&mut self, path: &str, value: &Value) -> Option<(FieldRef, FieldRef)> {
        let names: Option<Vec<&str>> = value
            .as_array()
            .filter(|items| items.len() == 2)
            .and_then(|items| items.iter().map(Value::as_str).collect());
        let Some(names) = names else {
            self.errors.push(ConfigError::InvalidJoinCondition {
                path: path.to_string(),
            });
            return None;
        };

        let left = self.resolve_in_scope(path, names[0]);
        let right = self.resolve_in_scope(path, names[1]);
        Some((left?.0, right?.0))
    }

    // ------------------------------------------------------------------------
    // Columns
    // ------------------------------------------------------------------------

    fn columns(&mut self, value: &Value, aggregations: &[Aggregation]) -> Step<Vec<Column>> {
        let items = self.list(Some(value), "columns", "a list of columns")?;
        if items.is_empty() {
            self.errors.push(ConfigError::NoColumns);
            return Ok(Vec::new());
        }
        self.too_many("columns", items.len(), self.limits.max_columns);

        let mut used = BTreeSet::new();
        let mut columns = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if let Some(column) = self.column(i, item, aggregations, &mut used) {
                columns.push(column);
            }
        }
        Ok(columns)
    }

    fn column(
        &mut self,
        index: usize,
        item: &Value,
        aggregations: &[Aggregation],
        used: &mut BTreeSet<String>,
    ) -> Option<Column> {
        let path = format!("columns[{}]", index);
        let Some(obj) = item.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path,
                expected: "a column object",
            });
            return None;
        };
        let before = self.errors.len();

        let label = non_empty_str(obj, "label").map(str::trim);
        if label.is_none() {
            self.errors.push(ConfigError::MissingValue {
                path: path.clone(),
                key: "label",
            });
        }

        let mut aggregation = match obj.get("aggregation") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let parsed = v.as_str().and_then(AggregateFunction::parse);
                if parsed.is_none() {
                    self.invalid(&path, "aggregation", v);
                }
                parsed
            }
        };

        let registry = self.registry;
        let mut meta: Option<&FieldMetadata> = None;
        let mut projected: Option<&Aggregation> = None;

        let expr = match obj.get("expression").filter(|v| !v.is_null()) {
            Some(expression) => {
                if aggregation.is_some() {
                    self.errors.push(ConfigError::InvalidExpression {
                        path: path.clone(),
                        message: "aggregations apply to plain fields only".into(),
                    });
                }
                self.column_expr(&path, expression, 0)
            }
            None => match non_empty_str(obj, "field") {
                None => {
                    self.errors.push(ConfigError::MissingValue {
                        path: path.clone(),
                        key: "field",
                    });
                    None
                }
                Some(raw) => {
                    if let Some(agg) = aggregations.iter().find(|a| a.alias == raw) {
                        // Column projecting a declared aggregation.
                        projected = Some(agg);
                        aggregation = Some(agg.function);
                        meta = registry.field(&agg.field.source, &agg.field.field);
                        Some(ColumnExpr::Field(agg.field.clone()))
                    } else {
                        self.resolve_in_scope(&path, raw).map(|(field, m)| {
                            meta = Some(m);
                            ColumnExpr::Field(field)
                        })
                    }
                }
            },
        };

        if let (Some(function), Some(m), Some(ColumnExpr::Field(field)), None) =
            (aggregation, meta, &expr, projected)
        {
            if function != AggregateFunction::Count && !m.aggregatable {
                self.errors.push(ConfigError::NotPermitted {
                    path: path.clone(),
                    field: field.full_name(),
                    capability: "aggregatable",
                });
            }
        }

        let format = match obj.get("format") {
            None | Some(Value::Null) => default_format(meta, aggregation),
            Some(v) => match v.as_str().and_then(ColumnFormat::parse) {
                Some(format) => format,
                None => {
                    self.invalid(&path, "format", v);
                    ColumnFormat::Text
                }
            },
        };

        let alias = match (projected, obj.get("alias")) {
            (Some(agg), _) => {
                if used.contains(&agg.alias) {
                    self.errors.push(ConfigError::DuplicateAlias {
                        path: path.clone(),
                        alias: agg.alias.clone(),
                    });
                }
                agg.alias.clone()
            }
            (None, None | Some(Value::Null)) => {
                default_column_alias(index, expr.as_ref(), aggregation, aggregations, used)
            }
            (None, Some(v)) => match v.as_str().filter(|a| is_identifier(a)) {
                Some(alias) => {
                    if used.contains(alias) || aggregations.iter().any(|a| a.alias == alias) {
                        self.errors.push(ConfigError::DuplicateAlias {
                            path: path.clone(),
                            alias: alias.to_string(),
                        });
                    }
                    alias.to_string()
                }
                None => {
                    self.invalid(&path, "alias", v);
                    String::new()
                }
            },
        };

        if self.errors.len() > before {
            return None;
        }
        used.insert(alias.clone());
        Some(Column {
            expr: expr?,
            label: label?.to_string(),
            format,
            aggregation,
            alias,
        })
    }

    /// Parse a derived column expression:
    /// `{"field": "a.b"}`, `{"value": 1}` or `{"function": "f", "args": [...]}`.
    fn column_expr(&mut self, path: &str, value: &Value, depth: usize) -> Option<ColumnExpr> {
        if depth > MAX_EXPRESSION_DEPTH {
            self.expression_error(path, "expression is nested too deeply".into());
            return None;
        }
        let Some(obj) = value.as_object() else {
            self.expression_error(
                path,
                "expected an object with 'field', 'value' or 'function'".into(),
            );
            return None;
        };

        if let Some(raw) = obj.get("field") {
            let Some(raw) = raw.as_str() else {
                self.expression_error(path, "'field' must be a source.field name".into());
                return None;
            };
            return self
                .resolve_in_scope(path, raw)
                .map(|(field, _)| ColumnExpr::Field(field));
        }

        if let Some(literal) = obj.get("value") {
            if literal.is_array() || literal.is_object() {
                self.expression_error(path, "literal values must be scalars".into());
                return None;
            }
            return Some(ColumnExpr::Literal(literal.clone()));
        }

        let Some(name) = obj.get("function") else {
            self.expression_error(
                path,
                "expected an object with 'field', 'value' or 'function'".into(),
            );
            return None;
        };
        let Some(function) = name.as_str().and_then(ScalarFunction::parse) else {
            self.expression_error(path, format!("function {} is not allowed", name));
            return None;
        };
        let Some(args) = obj.get("args").and_then(Value::as_array) else {
            self.expression_error(path, "'args' must be a list".into());
            return None;
        };
        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            self.expression_error(
                path,
                format!(
                    "{} takes {}..={} arguments, got {}",
                    function.sql_name(),
                    min,
                    max,
                    args.len()
                ),
            );
            return None;
        }

        let mut parsed = Vec::with_capacity(args.len());
        let mut complete = true;
        for arg in args {
            match self.column_expr(path, arg, depth + 1) {
                Some(expr) => parsed.push(expr),
                None => complete = false,
            }
        }
        complete.then_some(ColumnExpr::Call {
            function,
            args: parsed,
        })
    }

    // ------------------------------------------------------------------------
    // Aggregations
    // ------------------------------------------------------------------------

    fn aggregations(&mut self, value: &Value) -> Step<AggregationSpec> {
        let obj = match value {
            Value::Null => return Ok(AggregationSpec::default()),
            Value::Object(obj) => obj,
            _ => {
                self.errors.push(ConfigError::Malformed {
                    path: "aggregations".into(),
                    expected: "an object with group_by and functions",
                });
                return Err(Malformed);
            }
        };

        let group_items = self.list(obj.get("group_by"), "aggregations.group_by", "a list of fields")?;
        let function_items = self.list(
            obj.get("functions"),
            "aggregations.functions",
            "a list of aggregation functions",
        )?;

        self.too_many("aggregations", function_items.len(), self.limits.max_aggregations);

        let mut group_by: Vec<FieldRef> = Vec::new();
        for (i, item) in group_items.iter().enumerate() {
            let path = format!("group_by[{}]", i);
            let Some(raw) = item.as_str() else {
                self.invalid(&path, "field", item);
                continue;
            };
            if let Some((field, _)) = self.resolve_in_scope(&path, raw) {
                if !group_by.contains(&field) {
                    group_by.push(field);
                }
            }
        }

        let mut aliases = BTreeSet::new();
        let mut functions = Vec::new();
        for (i, item) in function_items.iter().enumerate() {
            if let Some(agg) = self.aggregation(&format!("aggregations[{}]", i), item, &mut aliases) {
                functions.push(agg);
            }
        }

        if !group_items.is_empty() && function_items.is_empty() {
            self.errors.push(ConfigError::GroupByWithoutAggregations);
        }

        Ok(AggregationSpec {
            group_by,
            functions,
        })
    }

    fn aggregation(
        &mut self,
        path: &str,
        item: &Value,
        aliases: &mut BTreeSet<String>,
    ) -> Option<Aggregation> {
        let Some(obj) = item.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path: path.to_string(),
                expected: "an aggregation object",
            });
            return None;
        };
        let before = self.errors.len();

        let function = match obj.get("function") {
            None | Some(Value::Null) => {
                self.errors.push(ConfigError::MissingValue {
                    path: path.to_string(),
                    key: "function",
                });
                None
            }
            Some(v) => {
                let parsed = v.as_str().and_then(AggregateFunction::parse);
                if parsed.is_none() {
                    self.invalid(path, "aggregate function", v);
                }
                parsed
            }
        };

        let field = match non_empty_str(obj, "field") {
            None => {
                self.errors.push(ConfigError::MissingValue {
                    path: path.to_string(),
                    key: "field",
                });
                None
            }
            Some(raw) => self.resolve_in_scope(path, raw),
        };

        if let (Some(function), Some((field, meta))) = (function, &field) {
            if function != AggregateFunction::Count && !meta.aggregatable {
                self.errors.push(ConfigError::NotPermitted {
                    path: path.to_string(),
                    field: field.full_name(),
                    capability: "aggregatable",
                });
            }
        }

        let alias = match obj.get("alias") {
            None | Some(Value::Null) => match (function, &field) {
                (Some(function), Some((field, _))) => {
                    format!("{}_{}", function.as_str(), field.default_alias())
                }
                _ => String::new(),
            },
            Some(v) => match v.as_str().filter(|a| is_identifier(a)) {
                Some(alias) => alias.to_string(),
                None => {
                    self.invalid(path, "alias", v);
                    String::new()
                }
            },
        };
        if !alias.is_empty() && !aliases.insert(alias.clone()) {
            self.errors.push(ConfigError::DuplicateAlias {
                path: path.to_string(),
                alias: alias.clone(),
            });
        }

        if self.errors.len() > before {
            return None;
        }
        Some(Aggregation {
            field: field?.0,
            function: function?,
            alias,
        })
    }

    // ------------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------------

    fn filters(&mut self, value: &Value) -> Step<Vec<FilterSlot>> {
        let items = self.list(Some(value), "filters", "a list of filters")?;
        self.too_many("filters", items.len(), self.limits.max_filters);

        let mut seen = BTreeSet::new();
        let mut slots = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if let Some(slot) = self.filter(&format!("filters[{}]", i), item, &mut seen) {
                slots.push(slot);
            }
        }
        Ok(slots)
    }

    fn filter(
        &mut self,
        path: &str,
        item: &Value,
        seen: &mut BTreeSet<String>,
    ) -> Option<FilterSlot> {
        let Some(obj) = item.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path: path.to_string(),
                expected: "a filter object",
            });
            return None;
        };
        let before = self.errors.len();

        let field = match non_empty_str(obj, "field") {
            None => {
                self.errors.push(ConfigError::MissingValue {
                    path: path.to_string(),
                    key: "field",
                });
                None
            }
            Some(raw) => self.resolve_in_scope(path, raw),
        };
        if let Some((field, meta)) = &field {
            if !meta.filterable {
                self.errors.push(ConfigError::NotPermitted {
                    path: path.to_string(),
                    field: field.full_name(),
                    capability: "filterable",
                });
            } else if !seen.insert(field.full_name()) {
                self.errors.push(ConfigError::DuplicateFilter {
                    path: path.to_string(),
                    field: field.full_name(),
                });
            }
        }

        let filter_type = match obj.get("type") {
            None | Some(Value::Null) => {
                self.errors.push(ConfigError::MissingValue {
                    path: path.to_string(),
                    key: "type",
                });
                None
            }
            Some(v) => {
                let parsed = v.as_str().and_then(FilterType::parse);
                if parsed.is_none() {
                    self.invalid(path, "filter type", v);
                }
                parsed
            }
        };

        let required = match obj.get("required") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(v) => {
                self.invalid(path, "required flag", v);
                false
            }
        };

        let options = match obj.get("options") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(options)) => options.clone(),
            Some(v) => {
                self.invalid(path, "options", v);
                Vec::new()
            }
        };

        if self.errors.len() > before {
            return None;
        }
        let (field, meta) = field?;
        let label = non_empty_str(obj, "label")
            .map(str::to_string)
            .unwrap_or_else(|| meta.label.clone());
        Some(FilterSlot {
            field,
            label,
            filter_type: filter_type?,
            required,
            options,
        })
    }

    // ------------------------------------------------------------------------
    // Sorting
    // ------------------------------------------------------------------------

    fn sorting(&mut self, value: &Value, aliases: &BTreeSet<&str>) -> Step<Vec<SortSpec>> {
        // A single sort object is accepted as a one-entry list.
        let items = match value {
            Value::Object(_) => std::slice::from_ref(value),
            other => self.list(Some(other), "sorting", "a list of sort entries")?,
        };

        let mut specs = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if let Some(spec) = self.sort(&format!("sorting[{}]", i), item, aliases) {
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    fn sort(&mut self, path: &str, item: &Value, aliases: &BTreeSet<&str>) -> Option<SortSpec> {
        let Some(obj) = item.as_object() else {
            self.errors.push(ConfigError::Malformed {
                path: path.to_string(),
                expected: "a sort object",
            });
            return None;
        };
        let before = self.errors.len();

        let direction = match obj.get("direction") {
            None | Some(Value::Null) => SortDirection::Asc,
            Some(v) => match v.as_str().and_then(SortDirection::parse) {
                Some(direction) => direction,
                None => {
                    self.invalid(path, "direction", v);
                    SortDirection::Asc
                }
            },
        };

        let target = match non_empty_str(obj, "field") {
            None => {
                self.errors.push(ConfigError::MissingValue {
                    path: path.to_string(),
                    key: "field",
                });
                None
            }
            Some(raw) if aliases.contains(raw) => Some(SortTarget::Alias(raw.to_string())),
            Some(raw) => match self.resolve_in_scope(path, raw) {
                Some((field, meta)) if !meta.sortable => {
                    self.errors.push(ConfigError::NotPermitted {
                        path: path.to_string(),
                        field: field.full_name(),
                        capability: "sortable",
                    });
                    None
                }
                Some((field, _)) => Some(SortTarget::Field(field)),
                None => None,
            },
        };

        if self.errors.len() > before {
            return None;
        }
        Some(SortSpec {
            target: target?,
            direction,
        })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn in_scope(&self, source: &str) -> bool {
        self.scope.iter().any(|s| s == source)
    }

    /// Resolve `source.field` against the registry and the report's sources.
    fn resolve_in_scope(&mut self, path: &str, raw: &str) -> Option<(FieldRef, &'a FieldMetadata)> {
        let registry = self.registry;
        let resolved = FieldRef::parse(raw).and_then(|field| {
            registry
                .field(&field.source, &field.field)
                .map(|meta| (field, meta))
        });
        let Some((field, meta)) = resolved else {
            self.errors.push(ConfigError::UnknownField {
                path: path.to_string(),
                field: raw.to_string(),
            });
            return None;
        };
        if !self.in_scope(&field.source) {
            self.errors.push(ConfigError::OutOfScope {
                path: path.to_string(),
                field: raw.to_string(),
            });
            return None;
        }
        Some((field, meta))
    }

    /// Items of an optional list section. Absent or null is empty.
    fn list<'v>(
        &mut self,
        value: Option<&'v Value>,
        path: &str,
        expected: &'static str,
    ) -> Step<&'v [Value]> {
        match value {
            None | Some(Value::Null) => Ok(&[]),
            Some(Value::Array(items)) => Ok(items.as_slice()),
            Some(_) => {
                self.errors.push(ConfigError::Malformed {
                    path: path.to_string(),
                    expected,
                });
                Err(Malformed)
            }
        }
    }

    fn invalid(&mut self, path: &str, key: &'static str, value: &Value) {
        self.errors.push(ConfigError::InvalidValue {
            path: path.to_string(),
            key,
            value: describe(value),
        });
    }

    fn expression_error(&mut self, path: &str, message: String) {
        self.errors.push(ConfigError::InvalidExpression {
            path: path.to_string(),
            message,
        });
    }
}

fn non_empty_str<'v>(obj: &'v Map<String, Value>, key: &str) -> Option<&'v str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn default_format(meta: Option<&FieldMetadata>, aggregation: Option<AggregateFunction>) -> ColumnFormat {
    if aggregation == Some(AggregateFunction::Count) {
        return ColumnFormat::Number;
    }
    match meta.map(|m| m.data_type) {
        Some(FieldType::Number) => ColumnFormat::Number,
        Some(FieldType::Date) => ColumnFormat::Date,
        Some(FieldType::DateTime) => ColumnFormat::DateTime,
        _ => ColumnFormat::Text,
    }
}

/// `source_field`, `{fn}_source_field` or `column_{index}`, suffixed until
/// unique. A column repeating a declared aggregation shares its alias.
fn default_column_alias(
    index: usize,
    expr: Option<&ColumnExpr>,
    aggregation: Option<AggregateFunction>,
    aggregations: &[Aggregation],
    used: &BTreeSet<String>,
) -> String {
    let field = expr.and_then(ColumnExpr::as_field);
    let base = match (field, aggregation) {
        (Some(field), Some(function)) => {
            let base = format!("{}_{}", function.as_str(), field.default_alias());
            let same = aggregations
                .iter()
                .any(|a| a.alias == base && a.function == function && &a.field == field);
            if same && !used.contains(&base) {
                return base;
            }
            base
        }
        (Some(field), None) => field.default_alias(),
        (None, _) => format!("column_{}", index),
    };

    let taken = |alias: &str| used.contains(alias) || aggregations.iter().any(|a| a.alias == alias);
    if !taken(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
