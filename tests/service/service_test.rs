use std::collections::BTreeMap;
use std::sync::Arc;

use quarry::config::Settings;
use quarry::execution::{FailureKind, RunRequest, SqliteDataStore};
use quarry::model::{DraftConfig, ExportFormat, Recurrence, ScheduleSpec};
use quarry::registry::Registry;
use quarry::scheduler::ScheduleError;
use quarry::service::{filters_from_json, ReportService, ServiceError};
use quarry::store::ReportStore;
use serde_json::json;

const FIXTURES: &str = "
    CREATE TABLE invoices (
        id INTEGER PRIMARY KEY,
        organization_id INTEGER NOT NULL,
        number TEXT NOT NULL,
        customer_id INTEGER,
        status TEXT,
        total_amount REAL
    );
    CREATE TABLE customers (
        id INTEGER PRIMARY KEY,
        organization_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        country TEXT
    );
    INSERT INTO customers (id, organization_id, name, country) VALUES
        (1, 1, 'Acme', 'AT'),
        (2, 1, 'Globex', 'DE'),
        (3, 2, 'Initech', 'AT');
    INSERT INTO invoices (id, organization_id, number, customer_id, status, total_amount) VALUES
        (1, 1, 'INV-001', 1, 'paid', 100.0),
        (2, 1, 'INV-002', 1, 'sent', 250.0),
        (3, 1, 'INV-003', 2, 'paid', 75.5),
        (4, 2, 'X-001', 3, 'paid', 999.0);
";

fn service() -> ReportService {
    let data = SqliteDataStore::open_in_memory().unwrap();
    data.execute_batch(FIXTURES).unwrap();
    ReportService::new(
        Arc::new(Registry::builtin().unwrap()),
        Arc::new(ReportStore::open_in_memory().unwrap()),
        Arc::new(data),
        &Settings::default(),
    )
    .unwrap()
}

fn revenue_by_customer() -> DraftConfig {
    serde_json::from_value(json!({
        "name": "Revenue by customer",
        "category": "finance",
        "data_sources": {
            "primary": "invoices",
            "joins": [{"table": "customers", "type": "left"}]
        },
        "columns": [
            {"field": "customers.name", "label": "Customer"},
            {"field": "revenue", "label": "Revenue", "format": "currency"}
        ],
        "filters": [{"field": "invoices.status", "type": "select"}],
        "aggregations": {
            "group_by": ["customers.name"],
            "functions": [
                {"field": "invoices.total_amount", "function": "sum", "alias": "revenue"}
            ]
        },
        "sorting": [{"field": "revenue", "direction": "desc"}]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_save_and_run_grouped_report() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();
    assert_eq!(saved.version, 1);
    assert_eq!(saved.execution_count, 0);

    let response = service
        .run_report(saved.id, RunRequest::ad_hoc(1, 10))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.meta.rows_count, 2);
    assert_eq!(
        response.data,
        vec![
            vec![json!("Acme"), json!("350.00 €")],
            vec![json!("Globex"), json!("75.50 €")]
        ]
    );

    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["columns"][1]["alias"], "revenue");
    assert_eq!(body["meta"]["truncated"], false);
    assert!(body.get("export").is_none());

    let executions = service.list_executions(1, saved.id, 10).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, response.meta.execution_id);
}

#[tokio::test]
async fn test_run_with_filters_and_export() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();

    let request = RunRequest::ad_hoc(1, 10)
        .with_filters(filters_from_json(&json!({"invoices.status": "paid"})))
        .with_export(ExportFormat::Xlsx);
    let response = service.run_report(saved.id, request).await.unwrap();

    assert_eq!(
        response.data,
        vec![
            vec![json!("Acme"), json!("100.00 €")],
            vec![json!("Globex"), json!("75.50 €")]
        ]
    );
    let export = response.export.unwrap();
    assert!(export.filename.ends_with(".xlsx"));
    assert_eq!(&export.bytes[..2], b"PK");
}

#[tokio::test]
async fn test_run_is_tenant_scoped() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();

    // Tenant 2 cannot run tenant 1's report
    let err = service
        .run_report(saved.id, RunRequest::ad_hoc(2, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ReportNotFound(id) if id == saved.id));

    let own = service.save_report(2, 20, &revenue_by_customer()).unwrap();
    let response = service
        .run_report(own.id, RunRequest::ad_hoc(2, 20))
        .await
        .unwrap();
    assert_eq!(
        response.data,
        vec![vec![json!("Initech"), json!("999.00 €")]]
    );
}

#[tokio::test]
async fn test_failed_run_surfaces_kind() {
    let service = service();
    let draft: DraftConfig = serde_json::from_value(json!({
        "name": "Payments",
        "category": "finance",
        "data_sources": {"primary": "payments"},
        "columns": [{"field": "payments.amount", "label": "Amount"}]
    }))
    .unwrap();
    let saved = service.save_report(1, 10, &draft).unwrap();

    let err = service
        .run_report(saved.id, RunRequest::ad_hoc(1, 10))
        .await
        .unwrap_err();
    match err {
        ServiceError::Execution(failure) => {
            assert_eq!(failure.kind, FailureKind::DataStore);
            assert!(failure.execution_id.is_some());
        }
        other => panic!("expected execution failure, got {}", other),
    }
}

#[tokio::test]
async fn test_test_report_previews_draft() {
    let service = service();
    let mut draft = revenue_by_customer();
    draft.name = None;

    let preview = service.test_report(1, &draft).await.unwrap();
    assert!(preview.success);
    assert_eq!(preview.rows_count, 2);
    assert!(preview.compiled_query_text.unwrap().contains("GROUP BY"));
    assert!(service.list_reports(1, 10).unwrap().is_empty());

    let mut broken = revenue_by_customer();
    broken.columns = json!([]);
    assert!(matches!(
        service.test_report(1, &broken).await,
        Err(ServiceError::Validation(_))
    ));
}

#[test]
fn test_update_bumps_version_on_layout_change() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();

    let mut renamed = revenue_by_customer();
    renamed.name = Some("Customer revenue".into());
    let updated = service.update_report(1, saved.id, &renamed).unwrap();
    assert_eq!(updated.name, "Customer revenue");
    assert_eq!(updated.version, 1);

    let mut changed = renamed.clone();
    changed.sorting = json!([{"field": "customers.name"}]);
    let updated = service.update_report(1, saved.id, &changed).unwrap();
    assert_eq!(updated.version, 2);
    assert_ne!(updated.config_hash, saved.config_hash);
}

#[test]
fn test_listing_and_defaults() {
    let service = service();
    let mut shared = revenue_by_customer();
    shared.name = Some("Shared".into());
    shared.is_shared = true;
    let shared = service.save_report(1, 10, &shared).unwrap();
    let private = service.save_report(1, 10, &revenue_by_customer()).unwrap();
    service.save_report(1, 11, &revenue_by_customer()).unwrap();

    let visible: Vec<_> = service
        .list_reports(1, 12)
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(visible, vec![shared.id]);

    assert!(service.set_default(1, private.id).unwrap().is_default);
    assert!(service.set_default(1, shared.id).unwrap().is_default);
    assert!(!service.get_report(1, private.id).unwrap().is_default);
}

#[test]
fn test_delete_removes_schedules() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();
    let spec = ScheduleSpec {
        recurrence: Recurrence::Weekly {
            day_of_week: "monday".into(),
            time: "08:00".into(),
        },
        filter_preset: BTreeMap::new(),
        recipients: vec!["cfo@example.com".into()],
        export_format: ExportFormat::Csv,
    };

    let schedule = service.create_schedule(1, 10, saved.id, spec).unwrap();
    assert!(service.get_report(1, saved.id).unwrap().is_scheduled);
    assert_eq!(service.list_schedules(1, Some(saved.id)).unwrap().len(), 1);

    service.delete_report(1, saved.id).unwrap();
    assert!(service.list_schedules(1, None).unwrap().is_empty());
    assert!(matches!(
        service.delete_schedule(1, schedule.id),
        Err(ServiceError::Schedule(ScheduleError::ScheduleNotFound(_)))
    ));
    assert!(matches!(
        service.delete_report(1, saved.id),
        Err(ServiceError::ReportNotFound(_))
    ));
}

#[test]
fn test_analyze_saved_report() {
    let service = service();
    let saved = service.save_report(1, 10, &revenue_by_customer()).unwrap();
    let analysis = service.analyze_report(1, saved.id).unwrap();
    // 1 join, 1 filter, 1 function, 1 group-by field, 2 columns
    assert_eq!(analysis.estimated_cost, 100 + 10 + 50 + 30 + 10);
    assert_eq!(analysis.used_relations, vec!["customer".to_string()]);
}
