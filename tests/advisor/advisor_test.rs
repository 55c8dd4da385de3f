use std::sync::Arc;

use quarry::advisor::{Complexity, QueryAdvisor, SuggestionKind};
use quarry::config::EngineLimits;
use quarry::model::{
    AggregationSpec, Column, ColumnExpr, ColumnFormat, FieldRef, JoinKind, JoinSpec, ReportLayout,
    SourceSpec,
};
use quarry::registry::Registry;
use quarry::sql::Dialect;
use quarry::validation::ConfigValidator;
use serde_json::{json, Value};

fn registry() -> Arc<Registry> {
    Arc::new(Registry::builtin().unwrap())
}

fn advisor() -> QueryAdvisor {
    QueryAdvisor::new(registry(), EngineLimits::default())
}

fn layout(value: Value) -> ReportLayout {
    let draft = serde_json::from_value(value).unwrap();
    ConfigValidator::new(registry(), EngineLimits::default())
        .build(&draft, false)
        .unwrap()
}

fn kinds(layout: &ReportLayout) -> Vec<SuggestionKind> {
    advisor()
        .suggestions(layout)
        .into_iter()
        .map(|s| s.kind)
        .collect()
}

#[test]
fn test_plain_listing() {
    let layout = layout(json!({
        "data_sources": {"primary": "customers"},
        "columns": [
            {"field": "customers.name", "label": "Name"},
            {"field": "customers.city", "label": "City"}
        ]
    }));

    let analysis = advisor().analyze(&layout);
    assert_eq!(analysis.estimated_cost, 10);
    assert_eq!(analysis.complexity, Complexity::Normal);
    assert_eq!(
        kinds(&layout),
        vec![SuggestionKind::NoFilters, SuggestionKind::NoSorting]
    );
    assert!(analysis.indexes.is_empty());
    assert!(analysis.used_relations.is_empty());
}

#[test]
fn test_filtered_and_sorted_report_has_no_hints() {
    let layout = layout(json!({
        "data_sources": {"primary": "invoices"},
        "columns": [{"field": "invoices.number", "label": "Number"}],
        "filters": [{"field": "invoices.status", "type": "select"}],
        "sorting": [{"field": "invoices.issued_on", "direction": "desc"}]
    }));

    assert!(kinds(&layout).is_empty());

    let indexes = advisor().suggest_indexes(&layout);
    let sql: Vec<_> = indexes.iter().map(|i| i.to_sql(Dialect::Sqlite)).collect();
    assert_eq!(
        sql,
        vec![
            "CREATE INDEX IF NOT EXISTS \"idx_invoices_organization_id_status\" ON \"invoices\" (\"organization_id\", \"status\")",
            "CREATE INDEX IF NOT EXISTS \"idx_invoices_organization_id_issued_on\" ON \"invoices\" (\"organization_id\", \"issued_on\")",
        ]
    );
}

#[test]
fn test_grouped_columns_not_flagged() {
    let layout = layout(json!({
        "data_sources": {"primary": "invoices"},
        "columns": [
            {"field": "invoices.status", "label": "Status"},
            {"field": "revenue", "label": "Revenue"}
        ],
        "filters": [{"field": "invoices.currency", "type": "select"}],
        "aggregations": {
            "group_by": ["invoices.status"],
            "functions": [{"field": "invoices.total_amount", "function": "sum", "alias": "revenue"}]
        },
        "sorting": [{"field": "revenue", "direction": "desc"}]
    }));

    assert!(!kinds(&layout).contains(&SuggestionKind::UngroupedColumn));
    // 1 filter, 1 function, 1 group-by field, 2 columns
    assert_eq!(advisor().estimate_cost(&layout), 10 + 50 + 30 + 10);
}

#[test]
fn test_join_heavy_report() {
    let join = |table: &str| JoinSpec {
        table: table.into(),
        join_type: JoinKind::Left,
        on: (FieldRef::new("invoices", "id"), FieldRef::new(table, "id")),
    };
    let field = FieldRef::new("invoices", "number");
    let layout = ReportLayout {
        data_sources: SourceSpec {
            primary: "invoices".into(),
            joins: ["customers", "payments", "invoice_items", "contracts", "projects", "materials"]
                .into_iter()
                .map(join)
                .collect(),
        },
        columns: vec![Column {
            alias: field.default_alias(),
            expr: ColumnExpr::Field(field),
            label: "Number".into(),
            format: ColumnFormat::Text,
            aggregation: None,
        }],
        filters: vec![],
        aggregations: AggregationSpec::default(),
        sorting: vec![],
    };

    let analysis = advisor().analyze(&layout);
    assert_eq!(analysis.estimated_cost, 605);
    assert_eq!(analysis.complexity, Complexity::VeryHigh);
    assert_eq!(
        kinds(&layout),
        vec![
            SuggestionKind::VeryHighComplexity,
            SuggestionKind::ManyJoins,
            SuggestionKind::NoFilters,
            SuggestionKind::NoSorting
        ]
    );
    assert_eq!(
        analysis.used_relations,
        vec!["customer".to_string(), "items".to_string(), "payments".to_string()]
    );

    let json = serde_json::to_value(&analysis).unwrap();
    assert_eq!(json["complexity"], "very_high");
    assert_eq!(json["suggestions"][1]["kind"], "many_joins");
}

#[test]
fn test_custom_thresholds() {
    let limits = EngineLimits {
        high_cost_threshold: 5,
        very_high_cost_threshold: 1000,
        ..EngineLimits::default()
    };
    let advisor = QueryAdvisor::new(registry(), limits);
    let layout = layout(json!({
        "data_sources": {"primary": "customers"},
        "columns": [
            {"field": "customers.name", "label": "Name"},
            {"field": "customers.city", "label": "City"}
        ]
    }));
    assert_eq!(advisor.analyze(&layout).complexity, Complexity::High);
}
