//! Report compilation: typed layout to a tenant-scoped, parameterized query.
//!
//! Every query the compiler emits filters the primary source by the tenant
//! column, and every joined source carries the same predicate inside its
//! `ON` clause so that `LEFT JOIN`s keep their semantics without reaching
//! another tenant's rows. User-supplied values only ever appear as bound
//! parameters.

mod filters;

use std::sync::Arc;

use serde::Serialize;

use crate::model::{
    AggregateFunction, ColumnExpr, ColumnFormat, FieldRef, JoinKind, ReportDefinition,
    ReportLayout, SortDirection, SortTarget, TenantId,
};
use crate::registry::{DataSource, Registry};
use crate::sql::{
    avg, col, count, func, max, min, param, sum, table_col, Dialect, Expr, ExprExt, JoinType,
    Literal, OrderByExpr, Query, Statement, TableRef,
};

/// Error type for compilation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Unknown data source: {0}")]
    UnknownSource(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Data source '{source_key}' is not part of the report (field {field})")]
    SourceNotJoined { source_key: String, field: String },

    #[error("Column '{0}' holds a literal that cannot be bound")]
    InvalidLiteral(String),

    #[error("Sort alias '{0}' is not an output column")]
    UnknownAlias(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Describes one column of the result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputColumn {
    pub alias: String,
    pub label: String,
    pub format: ColumnFormat,
}

/// A compiled report query, ready to bind and run.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    query: Query,
    columns: Vec<OutputColumn>,
    tenant_id: TenantId,
    /// Source keys joined into the query.
    scope: Vec<String>,
}

impl CompiledQuery {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Output columns in projection order.
    pub fn columns(&self) -> &[OutputColumn] {
        &self.columns
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// SQL text and bound values for `dialect`.
    pub fn statement(&self, dialect: Dialect) -> Statement {
        self.query.statement(dialect)
    }

    /// SQL text for the default dialect, placeholders unexpanded.
    pub fn sql_text(&self) -> String {
        self.query.to_sql(Dialect::default())
    }

    /// Cap the number of returned rows.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    fn includes(&self, source: &str) -> bool {
        self.scope.iter().any(|s| s == source)
    }

    fn and_filter(mut self, predicate: Expr) -> Self {
        self.query = self.query.filter(predicate);
        self
    }
}

/// Compiles report layouts against a registry.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    registry: Arc<Registry>,
}

impl QueryCompiler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Compile a persisted definition for `tenant_id`.
    pub fn compile(
        &self,
        definition: &ReportDefinition,
        tenant_id: TenantId,
    ) -> CompileResult<CompiledQuery> {
        self.compile_layout(&definition.layout, tenant_id)
    }

    /// Compile a layout for `tenant_id`.
    ///
    /// Fails when the registry no longer resolves a source or field the
    /// layout uses.
    pub fn compile_layout(
        &self,
        layout: &ReportLayout,
        tenant_id: TenantId,
    ) -> CompileResult<CompiledQuery> {
        let primary = self.source(&layout.data_sources.primary)?;
        let mut scope = vec![primary.key.clone()];
        let mut query = Query::new().from(table_ref(primary));

        // JOINs, each scoped to the tenant
        for join in &layout.data_sources.joins {
            let target = self.source(&join.table)?;
            scope.push(target.key.clone());

            let left = self.field_expr(&join.on.0, &scope)?;
            let right = self.field_expr(&join.on.1, &scope)?;
            let on = left
                .eq(right)
                .and(table_col(&target.key, &target.tenant_column).eq(param(tenant_id)));
            let join_type = match join.join_type {
                JoinKind::Inner => JoinType::Inner,
                JoinKind::Left => JoinType::Left,
            };
            query = query.join(join_type, table_ref(target), on);
        }

        // SELECT list
        let mut select = Vec::new();
        let mut columns = Vec::new();
        for column in &layout.columns {
            let expr = self.column_expr(&column.expr, &column.alias, &scope)?;
            let expr = match column.aggregation {
                Some(function) => aggregate(function, expr),
                None => expr,
            };
            select.push(expr.alias(&column.alias));
            columns.push(OutputColumn {
                alias: column.alias.clone(),
                label: column.label.clone(),
                format: column.format,
            });
        }

        if layout.is_aggregated() {
            let group_by = layout
                .aggregations
                .group_by
                .iter()
                .map(|f| self.field_expr(f, &scope))
                .collect::<CompileResult<Vec<_>>>()?;
            if !group_by.is_empty() {
                query = query.group_by(group_by);
            }
        }

        // ORDER BY
        let mut order_by = Vec::new();
        for sort in &layout.sorting {
            let expr = match &sort.target {
                SortTarget::Field(field) => self.field_expr(field, &scope)?,
                SortTarget::Alias(alias) => {
                    if columns.iter().any(|c| &c.alias == alias) {
                        col(alias)
                    } else {
                        // Aggregates outside the column list are ordered by
                        // expression and never projected.
                        let agg = layout
                            .aggregations
                            .functions
                            .iter()
                            .find(|a| &a.alias == alias)
                            .ok_or_else(|| CompileError::UnknownAlias(alias.clone()))?;
                        aggregate(agg.function, self.field_expr(&agg.field, &scope)?)
                    }
                }
            };
            order_by.push(match sort.direction {
                SortDirection::Asc => OrderByExpr::asc(expr),
                SortDirection::Desc => OrderByExpr::desc(expr),
            });
        }
        if !order_by.is_empty() {
            query = query.order_by(order_by);
        }

        // Tenant predicate first; user filters are ANDed after it.
        let query = query
            .select(select)
            .filter(table_col(&primary.key, &primary.tenant_column).eq(param(tenant_id)));

        Ok(CompiledQuery {
            query,
            columns,
            tenant_id,
            scope,
        })
    }

    fn source(&self, key: &str) -> CompileResult<&DataSource> {
        self.registry
            .get(key)
            .filter(|s| s.is_valid())
            .ok_or_else(|| CompileError::UnknownSource(key.to_string()))
    }

    /// Qualified column for a field, checked against the joined sources.
    fn field_expr(&self, field: &FieldRef, scope: &[String]) -> CompileResult<Expr> {
        if !scope.iter().any(|s| *s == field.source) {
            return Err(CompileError::SourceNotJoined {
                source_key: field.source.clone(),
                field: field.full_name(),
            });
        }
        let meta = self
            .registry
            .field(&field.source, &field.field)
            .ok_or_else(|| CompileError::UnknownField(field.full_name()))?;
        Ok(table_col(&field.source, meta.column_name()))
    }

    fn column_expr(&self, expr: &ColumnExpr, alias: &str, scope: &[String]) -> CompileResult<Expr> {
        match expr {
            ColumnExpr::Field(field) => self.field_expr(field, scope),
            ColumnExpr::Literal(value) => Literal::from_json(value)
                .map(Expr::Param)
                .ok_or_else(|| CompileError::InvalidLiteral(alias.to_string())),
            ColumnExpr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.column_expr(arg, alias, scope))
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(func(function.sql_name(), args))
            }
        }
    }
}

fn table_ref(source: &DataSource) -> TableRef {
    let table = TableRef::new(&source.table);
    if source.table == source.key {
        table
    } else {
        table.with_alias(&source.key)
    }
}

fn aggregate(function: AggregateFunction, expr: Expr) -> Expr {
    match function {
        AggregateFunction::Sum => sum(expr),
        AggregateFunction::Count => count(expr),
        AggregateFunction::Avg => avg(expr),
        AggregateFunction::Min => min(expr),
        AggregateFunction::Max => max(expr),
    }
}
