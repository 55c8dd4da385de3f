use std::sync::Arc;

use quarry::config::EngineLimits;
use quarry::model::{AggregateFunction, DraftConfig, FilterType, JoinKind};
use quarry::registry::Registry;
use quarry::validation::{ConfigError, ConfigValidator};
use serde_json::{json, Value};

fn validator() -> ConfigValidator {
    validator_with(EngineLimits::default())
}

fn validator_with(limits: EngineLimits) -> ConfigValidator {
    ConfigValidator::new(Arc::new(Registry::builtin().unwrap()), limits)
}

fn draft(value: Value) -> DraftConfig {
    serde_json::from_value(value).unwrap()
}

fn paths(errors: &[ConfigError]) -> Vec<&str> {
    errors.iter().filter_map(ConfigError::path).collect()
}

#[test]
fn test_unknown_primary_still_checks_limits() {
    let columns: Vec<Value> = (0..51)
        .map(|i| json!({"field": "ledger.id", "label": format!("C{}", i)}))
        .collect();
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "ledger"},
            "columns": columns,
            "aggregations": {"group_by": ["ledger.id"]}
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![
            ConfigError::UnknownSource {
                path: "data_sources.primary".into(),
                source: "ledger".into()
            },
            ConfigError::TooMany {
                section: "columns",
                count: 51,
                max: 50
            },
            ConfigError::GroupByWithoutAggregations,
        ]
    );
}

#[test]
fn test_missing_primary_still_checks_joins_and_filters() {
    let limits = EngineLimits {
        max_joins: 1,
        max_filters: 1,
        ..EngineLimits::default()
    };
    let errors = validator_with(limits).validate(
        &draft(json!({
            "data_sources": {"joins": [{"table": "customers"}, {"table": "payments"}]},
            "columns": [],
            "filters": [{"field": "a.b"}, {"field": "c.d"}]
        })),
        false,
    );
    assert_eq!(errors.len(), 4);
    assert!(matches!(errors[0], ConfigError::MissingValue { key: "primary", .. }));
    assert_eq!(
        errors[1..].to_vec(),
        vec![
            ConfigError::TooMany {
                section: "joins",
                count: 2,
                max: 1
            },
            ConfigError::NoColumns,
            ConfigError::TooMany {
                section: "filters",
                count: 2,
                max: 1
            },
        ]
    );
}

#[test]
fn test_missing_data_sources() {
    let errors = validator().validate(&DraftConfig::default(), false);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ConfigError::Malformed { .. }));
}

#[test]
fn test_collects_every_item_error() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "invoices"},
            "columns": [
                {"field": "invoices.nope", "label": "X"},
                {"field": "invoices.number"}
            ],
            "filters": [{"field": "invoices.status", "type": "bogus"}],
            "sorting": [{"field": "invoices.number", "direction": "sideways"}]
        })),
        false,
    );

    assert_eq!(
        paths(&errors),
        vec!["columns[0]", "columns[1]", "filters[0]", "sorting[0]"]
    );
    assert_eq!(
        errors[1],
        ConfigError::MissingValue {
            path: "columns[1]".into(),
            key: "label"
        }
    );
    assert_eq!(errors[2].to_string(), "filters[0]: invalid filter type 'bogus'");
}

#[test]
fn test_no_columns() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "invoices"},
            "columns": []
        })),
        false,
    );
    assert_eq!(errors, vec![ConfigError::NoColumns]);
}

#[test]
fn test_column_limit() {
    let limits = EngineLimits {
        max_columns: 2,
        ..EngineLimits::default()
    };
    let errors = validator_with(limits).validate(
        &draft(json!({
            "data_sources": {"primary": "invoices"},
            "columns": [
                {"field": "invoices.number", "label": "A"},
                {"field": "invoices.status", "label": "B"},
                {"field": "invoices.currency", "label": "C"}
            ]
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![ConfigError::TooMany {
            section: "columns",
            count: 3,
            max: 2
        }]
    );
}

fn joined(tables: &[&str]) -> DraftConfig {
    let joins: Vec<Value> = tables.iter().map(|t| json!({"table": t})).collect();
    draft(json!({
        "data_sources": {"primary": "invoices", "joins": joins},
        "columns": [{"field": "invoices.number", "label": "Number"}]
    }))
}

#[test]
fn test_join_limit_boundary() {
    let limits = EngineLimits {
        max_joins: 2,
        ..EngineLimits::default()
    };
    let validator = validator_with(limits);

    let at_limit = joined(&["customers", "invoice_items"]);
    assert!(validator.validate(&at_limit, false).is_empty());

    let over_limit = joined(&["customers", "invoice_items", "payments"]);
    assert_eq!(
        validator.validate(&over_limit, false),
        vec![ConfigError::TooMany {
            section: "joins",
            count: 3,
            max: 2
        }]
    );
}

#[test]
fn test_duplicate_join() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {
                "primary": "invoices",
                "joins": [{"table": "customers"}, {"table": "customers"}]
            },
            "columns": [{"field": "customers.name", "label": "Customer"}]
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![ConfigError::DuplicateJoin {
            path: "joins[1]".into(),
            table: "customers".into()
        }]
    );
}

#[test]
fn test_explicit_join_condition() {
    let layout = validator()
        .build(
            &draft(json!({
                "data_sources": {
                    "primary": "payments",
                    "joins": [{
                        "table": "invoices",
                        "type": "inner",
                        "on": ["payments.invoice_id", "invoices.id"]
                    }]
                },
                "columns": [{"field": "invoices.number", "label": "Invoice"}]
            })),
            false,
        )
        .unwrap();
    let join = &layout.data_sources.joins[0];
    assert_eq!(join.join_type, JoinKind::Inner);
    assert_eq!(join.on.0.full_name(), "payments.invoice_id");
    assert_eq!(join.on.1.full_name(), "invoices.id");

    let errors = validator().validate(
        &draft(json!({
            "data_sources": {
                "primary": "payments",
                "joins": [{"table": "invoices", "on": ["payments.invoice_id"]}]
            },
            "columns": [{"field": "payments.invoice_id", "label": "Invoice"}]
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![ConfigError::InvalidJoinCondition {
            path: "joins[0]".into()
        }]
    );
}

#[test]
fn test_filter_capability_checked() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "customers"},
            "columns": [{"field": "customers.name", "label": "Name"}],
            "filters": [{"field": "customers.id", "type": "number"}]
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![ConfigError::NotPermitted {
            path: "filters[0]".into(),
            field: "customers.id".into(),
            capability: "filterable"
        }]
    );
}

#[test]
fn test_filter_slot_defaults() {
    let layout = validator()
        .build(
            &draft(json!({
                "data_sources": {"primary": "invoices"},
                "columns": [{"field": "invoices.number", "label": "Number"}],
                "filters": [
                    {"field": "invoices.status", "type": "select", "options": ["paid", "sent"]},
                    {"field": "invoices.issued_on", "label": "Issued", "type": "date_range", "required": true}
                ]
            })),
            false,
        )
        .unwrap();

    let status = &layout.filters[0];
    assert_eq!(status.label, "Status");
    assert_eq!(status.filter_type, FilterType::Select);
    assert!(!status.required);
    assert_eq!(status.options.len(), 2);

    let issued = &layout.filters[1];
    assert_eq!(issued.label, "Issued");
    assert_eq!(issued.filter_type, FilterType::DateRange);
    assert!(issued.required);
}

#[test]
fn test_group_by_requires_functions() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "invoices"},
            "columns": [{"field": "invoices.status", "label": "Status"}],
            "aggregations": {"group_by": ["invoices.status"]}
        })),
        false,
    );
    assert_eq!(errors, vec![ConfigError::GroupByWithoutAggregations]);
}

#[test]
fn test_aggregation_capability() {
    let errors = validator().validate(
        &draft(json!({
            "data_sources": {"primary": "invoices"},
            "columns": [{"field": "invoices.status", "label": "Status"}],
            "aggregations": {
                "functions": [{"field": "invoices.status", "function": "sum"}]
            }
        })),
        false,
    );
    assert_eq!(
        errors,
        vec![ConfigError::NotPermitted {
            path: "aggregations[0]".into(),
            field: "invoices.status".into(),
            capability: "aggregatable"
        }]
    );

    // COUNT works on any field.
    let layout = validator()
        .build(
            &draft(json!({
                "data_sources": {"primary": "invoices"},
                "columns": [{"field": "invoices.status", "label": "Status"}],
                "aggregations": {
                    "group_by": ["invoices.status"],
                    "functions": [{"field": "invoices.status", "function": "count"}]
                }
            })),
            false,
        )
        .unwrap();
    let count = &layout.aggregations.functions[0];
    assert_eq!(count.function, AggregateFunction::Count);
    assert_eq!(count.alias, "count_invoices_status");
}

#[test]
fn test_single_sort_object() {
    let layout = validator()
        .build(
            &draft(json!({
                "data_sources": {"primary": "invoices"},
                "columns": [{"field": "invoices.number", "label": "Number"}],
                "sorting": {"field": "invoices.number"}
            })),
            false,
        )
        .unwrap();
    assert_eq!(layout.sorting.len(), 1);
}

#[test]
fn test_build_and_validate_agree() {
    let input = draft(json!({
        "name": "Open invoices",
        "category": "finance",
        "data_sources": {"primary": "invoices"},
        "columns": [{"field": "invoices.number", "label": "Number"}]
    }));
    assert!(validator().validate(&input, true).is_empty());
    assert!(validator().build(&input, true).is_ok());
}

#[test]
fn test_validation_is_repeatable() {
    let input = draft(json!({
        "data_sources": {
            "primary": "invoices",
            "joins": [{"table": "ledger"}, {"table": "customers"}]
        },
        "columns": [
            {"field": "invoices.nope", "label": "X"},
            {"field": "customers.name"},
            {"field": "payments.amount", "label": "Paid"}
        ],
        "filters": [{"field": "invoices.status", "type": "bogus"}],
        "aggregations": {"group_by": ["invoices.status"]},
        "sorting": [{"field": "missing_alias"}]
    }));
    let validator = validator();

    let first = validator.validate(&input, true);
    let second = validator.validate(&input, true);
    assert!(first.len() > 3);
    assert_eq!(first, second);
}
