use std::collections::BTreeMap;
use std::sync::Arc;

use quarry::compiler::{CompileError, QueryCompiler};
use quarry::config::EngineLimits;
use quarry::model::{ReportDefinition, ReportLayout};
use quarry::registry::Registry;
use quarry::sql::{Dialect, Literal};
use quarry::validation::ConfigValidator;
use serde_json::{json, Value};

fn registry() -> Arc<Registry> {
    Arc::new(Registry::builtin().unwrap())
}

fn layout(value: Value) -> ReportLayout {
    let draft = serde_json::from_value(value).unwrap();
    ConfigValidator::new(registry(), EngineLimits::default())
        .build(&draft, false)
        .unwrap()
}

fn values(value: Value) -> BTreeMap<String, Value> {
    serde_json::from_value(value).unwrap()
}

fn invoices_with_filters() -> ReportLayout {
    layout(json!({
        "data_sources": {"primary": "invoices"},
        "columns": [
            {"field": "invoices.number", "label": "Number"},
            {"field": "invoices.total_amount", "label": "Total", "format": "currency"}
        ],
        "filters": [
            {"field": "invoices.status", "type": "select"},
            {"field": "invoices.number", "type": "text"},
            {"field": "invoices.currency", "type": "multiselect", "required": true}
        ]
    }))
}

#[test]
fn test_every_source_carries_tenant_predicate() {
    let layout = layout(json!({
        "data_sources": {
            "primary": "invoices",
            "joins": [
                {"table": "customers", "type": "left"},
                {"table": "payments", "type": "left"}
            ]
        },
        "columns": [
            {"field": "invoices.number", "label": "Number"},
            {"field": "customers.name", "label": "Customer"},
            {"field": "payments.amount", "label": "Paid"}
        ]
    }));

    let stmt = QueryCompiler::new(registry())
        .compile_layout(&layout, 9)
        .unwrap()
        .statement(Dialect::Postgres);

    assert!(stmt
        .sql
        .contains("\"customers\".\"organization_id\" = $1"));
    assert!(stmt.sql.contains("\"payments\".\"organization_id\" = $2"));
    assert!(stmt
        .sql
        .contains("WHERE \"invoices\".\"organization_id\" = $3"));
    assert_eq!(stmt.params, vec![Literal::Int(9); 3]);
}

#[test]
fn test_user_filters_narrow_the_query() {
    let layout = invoices_with_filters();
    let compiler = QueryCompiler::new(registry());
    let compiled = compiler.compile_layout(&layout, 5).unwrap();

    let filtered = compiler.apply_user_filters(
        compiled,
        &values(json!({
            "invoices.status": "paid",
            "invoices.number": "",
            "invoices.customer_id": 3
        })),
        &layout,
    );
    let stmt = filtered.statement(Dialect::Sqlite);

    // Tenant first, then the one usable filter value
    assert_eq!(
        stmt.params,
        vec![Literal::Int(5), Literal::String("paid".into())]
    );
    assert!(stmt.sql.contains("\"invoices\".\"organization_id\" = ?1"));
    assert!(stmt.sql.contains("\"invoices\".\"status\" = ?2"));
    assert!(!stmt.sql.contains("customer_id"));
}

#[test]
fn test_values_never_inlined() {
    let layout = invoices_with_filters();
    let compiler = QueryCompiler::new(registry());
    let hostile = "x'; DROP TABLE invoices; --";

    let filtered = compiler.apply_user_filters(
        compiler.compile_layout(&layout, 1).unwrap(),
        &values(json!({
            "invoices.status": hostile,
            "invoices.currency": ["EUR", hostile]
        })),
        &layout,
    );

    for dialect in [Dialect::Sqlite, Dialect::Postgres, Dialect::MySql] {
        let stmt = filtered.statement(dialect);
        assert!(!stmt.sql.contains("DROP TABLE"), "{:?}", dialect);
        assert!(stmt.params.contains(&Literal::String(hostile.into())));
    }
}

#[test]
fn test_required_filter_with_null() {
    let layout = invoices_with_filters();
    let compiler = QueryCompiler::new(registry());
    let stmt = compiler
        .apply_user_filters(
            compiler.compile_layout(&layout, 1).unwrap(),
            &values(json!({"invoices.currency": null, "invoices.status": null})),
            &layout,
        )
        .statement(Dialect::Sqlite);

    assert!(stmt.sql.contains("\"invoices\".\"currency\" IS NULL"));
    assert!(!stmt.sql.contains("\"invoices\".\"status\" IS NULL"));
    assert_eq!(stmt.params, vec![Literal::Int(1)]);
}

#[test]
fn test_mysql_placeholders_and_quoting() {
    let layout = invoices_with_filters();
    let stmt = QueryCompiler::new(registry())
        .compile_layout(&layout, 4)
        .unwrap()
        .statement(Dialect::MySql);
    assert!(stmt.sql.contains("`invoices`.`organization_id` = ?"));
    assert!(!stmt.sql.contains("?1"));
    assert_eq!(stmt.params, vec![Literal::Int(4)]);
}

#[test]
fn test_grouped_report() {
    let layout = layout(json!({
        "data_sources": {
            "primary": "invoices",
            "joins": [{"table": "customers"}]
        },
        "columns": [{"field": "customers.country", "label": "Country"}],
        "aggregations": {
            "group_by": ["customers.country"],
            "functions": [
                {"field": "invoices.total_amount", "function": "sum", "alias": "revenue"},
                {"field": "invoices.id", "function": "count", "alias": "invoice_count"}
            ]
        },
        "sorting": [{"field": "revenue", "direction": "desc"}]
    }));

    let compiled = QueryCompiler::new(registry())
        .compile_layout(&layout, 2)
        .unwrap();
    let sql = compiled.sql_text();
    assert!(sql.contains("GROUP BY \"customers\".\"country\""));
    assert!(sql.contains("ORDER BY SUM(\"invoices\".\"total_amount\") DESC"));
    // Only declared columns are projected
    assert!(!sql.contains("COUNT("));

    let aliases: Vec<_> = compiled.columns().iter().map(|c| c.alias.as_str()).collect();
    assert_eq!(aliases, vec!["customers_country"]);
}

#[test]
fn test_stale_definition_fails_to_compile() {
    let layout = layout(json!({
        "data_sources": {"primary": "invoices"},
        "columns": [{"field": "invoices.number", "label": "Number"}]
    }));
    let definition = ReportDefinition::new(1, 1, "Old", layout);

    // A catalog that no longer lists invoices
    let shrunk = Registry::from_toml_str(
        r#"
        [sources.customers]
        table = "customers"
        model = "Customer"
        [sources.customers.fields.id]
        type = "number"
        "#,
    )
    .unwrap();

    let err = QueryCompiler::new(Arc::new(shrunk))
        .compile(&definition, 1)
        .unwrap_err();
    assert!(matches!(err, CompileError::UnknownSource(ref key) if key == "invoices"));
}
