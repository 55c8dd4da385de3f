use std::collections::BTreeMap;
use std::sync::Arc;

use quarry::compiler::QueryCompiler;
use quarry::config::EngineLimits;
use quarry::execution::{
    CancelHandle, ExecutionEngine, Exporter, FailureKind, RunRequest, SqliteDataStore,
};
use quarry::model::{ExecutionStatus, ExportFormat, ReportDefinition, ReportLayout};
use quarry::registry::Registry;
use quarry::store::ReportStore;
use quarry::validation::ConfigValidator;
use serde_json::{json, Value};

const FIXTURES: &str = "
    CREATE TABLE invoices (
        id INTEGER PRIMARY KEY,
        organization_id INTEGER NOT NULL,
        number TEXT NOT NULL,
        customer_id INTEGER,
        status TEXT,
        issued_on TEXT,
        due_on TEXT,
        total_amount REAL,
        tax_amount REAL,
        currency TEXT,
        created_at TEXT
    );
    INSERT INTO invoices (id, organization_id, number, status, issued_on, total_amount, currency) VALUES
        (1, 1, 'INV-001', 'paid', '2024-03-01', 1234.5, 'EUR'),
        (2, 1, 'INV-002', 'sent', '2024-03-05', 1200.0, 'EUR'),
        (3, 1, 'INV-003', 'paid', '2024-03-09', 99.99, 'USD'),
        (4, 2, 'OTHER-001', 'paid', '2024-03-02', 5000.0, 'EUR');
";

struct Fixture {
    registry: Arc<Registry>,
    store: Arc<ReportStore>,
    data: Arc<SqliteDataStore>,
}

impl Fixture {
    fn new() -> Self {
        let data = SqliteDataStore::open_in_memory().unwrap();
        data.execute_batch(FIXTURES).unwrap();
        Self {
            registry: Arc::new(Registry::builtin().unwrap()),
            store: Arc::new(ReportStore::open_in_memory().unwrap()),
            data: Arc::new(data),
        }
    }

    fn engine(&self, limits: EngineLimits) -> ExecutionEngine {
        ExecutionEngine::new(
            QueryCompiler::new(Arc::clone(&self.registry)),
            Arc::clone(&self.store),
            self.data.clone(),
            limits,
        )
    }

    fn layout(&self, value: Value) -> ReportLayout {
        let draft = serde_json::from_value(value).unwrap();
        ConfigValidator::new(Arc::clone(&self.registry), EngineLimits::default())
            .build(&draft, false)
            .unwrap()
    }

    fn save(&self, tenant_id: i64, layout: ReportLayout) -> ReportDefinition {
        self.store
            .insert_definition(&ReportDefinition::new(tenant_id, 1, "Invoice list", layout))
            .unwrap()
    }

    fn invoice_list(&self, tenant_id: i64) -> ReportDefinition {
        let layout = self.layout(json!({
            "data_sources": {"primary": "invoices"},
            "columns": [
                {"field": "invoices.number", "label": "Number"},
                {"field": "invoices.total_amount", "label": "Total", "format": "currency"},
                {"field": "invoices.issued_on", "label": "Issued"}
            ],
            "filters": [{"field": "invoices.status", "type": "select"}],
            "sorting": [{"field": "invoices.number"}]
        }));
        self.save(tenant_id, layout)
    }
}

#[tokio::test]
async fn test_run_is_tenant_scoped_and_formatted() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let engine = fixture.engine(EngineLimits::default());

    let outcome = engine
        .execute(&definition, RunRequest::ad_hoc(1, 1))
        .await
        .unwrap();

    assert_eq!(outcome.row_count, 3);
    assert!(!outcome.truncated);
    assert_eq!(
        outcome.rows[0],
        vec![json!("INV-001"), json!("1,234.50 €"), json!("2024-03-01")]
    );
    assert_eq!(outcome.rows[1][1], json!("1,200.00 €"));
    assert!(outcome
        .rows
        .iter()
        .all(|row| row[0].as_str().unwrap().starts_with("INV-")));

    let execution = fixture
        .store
        .get_execution(1, outcome.execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.row_count, Some(3));
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    // Another tenant cannot see the record
    assert!(fixture
        .store
        .get_execution(2, outcome.execution_id)
        .unwrap()
        .is_none());

    let reloaded = fixture.store.get_definition(1, definition.id).unwrap().unwrap();
    assert_eq!(reloaded.execution_count, 1);
    assert!(reloaded.last_executed_at.is_some());
}

#[tokio::test]
async fn test_runtime_filter_applied() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let engine = fixture.engine(EngineLimits::default());

    let mut filters = BTreeMap::new();
    filters.insert("invoices.status".to_string(), json!("paid"));
    // Not a declared filter; ignored
    filters.insert("invoices.currency".to_string(), json!("USD"));

    let outcome = engine
        .execute(&definition, RunRequest::ad_hoc(1, 1).with_filters(filters))
        .await
        .unwrap();

    let numbers: Vec<_> = outcome.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(numbers, vec![json!("INV-001"), json!("INV-003")]);

    let execution = fixture
        .store
        .get_execution(1, outcome.execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(execution.filters["invoices.status"], json!("paid"));
}

#[tokio::test]
async fn test_row_cap_truncates() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let engine = fixture.engine(EngineLimits {
        row_cap: 2,
        ..EngineLimits::default()
    });

    let outcome = engine
        .execute(&definition, RunRequest::ad_hoc(1, 1))
        .await
        .unwrap();
    assert_eq!(outcome.row_count, 2);
    assert_eq!(outcome.rows.len(), 2);
    assert!(outcome.truncated);

    let execution = fixture
        .store
        .get_execution(1, outcome.execution_id)
        .unwrap()
        .unwrap();
    assert!(execution.truncated);
    assert_eq!(execution.row_count, Some(2));
}

#[tokio::test]
async fn test_cancelled_run_is_recorded_as_failed() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let engine = fixture.engine(EngineLimits::default());

    let cancel = CancelHandle::new();
    cancel.cancel();
    let failure = engine
        .execute(&definition, RunRequest::ad_hoc(1, 1).with_cancel(cancel))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::Cancelled);
    let execution_id = failure.execution_id.unwrap();
    let execution = fixture.store.get_execution(1, execution_id).unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("cancelled"));
    assert!(execution.duration_ms.is_some());
}

#[tokio::test]
async fn test_compile_failure_does_not_count() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);

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
    let engine = ExecutionEngine::new(
        QueryCompiler::new(Arc::new(shrunk)),
        Arc::clone(&fixture.store),
        fixture.data.clone(),
        EngineLimits::default(),
    );

    let failure = engine
        .execute(&definition, RunRequest::ad_hoc(1, 1))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Compile);

    let execution = fixture
        .store
        .get_execution(1, failure.execution_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!execution.error.unwrap().contains("SELECT"));

    let reloaded = fixture.store.get_definition(1, definition.id).unwrap().unwrap();
    assert_eq!(reloaded.execution_count, 0);
}

#[tokio::test]
async fn test_failed_attempt_counting_is_configurable() {
    let fixture = Fixture::new();
    // customers has no table in the data store
    let layout = fixture.layout(json!({
        "data_sources": {"primary": "customers"},
        "columns": [{"field": "customers.name", "label": "Name"}]
    }));
    let counted = fixture.save(1, layout.clone());
    let uncounted = fixture.save(1, layout);

    let failure = fixture
        .engine(EngineLimits::default())
        .execute(&counted, RunRequest::ad_hoc(1, 1))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::DataStore);

    fixture
        .engine(EngineLimits::default())
        .count_failed_attempts(false)
        .execute(&uncounted, RunRequest::ad_hoc(1, 1))
        .await
        .unwrap_err();

    let counted = fixture.store.get_definition(1, counted.id).unwrap().unwrap();
    let uncounted = fixture.store.get_definition(1, uncounted.id).unwrap().unwrap();
    assert_eq!(counted.execution_count, 1);
    assert_eq!(uncounted.execution_count, 0);
}

#[tokio::test]
async fn test_csv_export_written() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let dir = tempfile::tempdir().unwrap();
    let engine = fixture
        .engine(EngineLimits::default())
        .with_exporter(Exporter::new(Some(dir.path().to_path_buf())));

    let outcome = engine
        .execute(
            &definition,
            RunRequest::ad_hoc(1, 1).with_export(ExportFormat::Csv),
        )
        .await
        .unwrap();

    let artifact = outcome.export.unwrap();
    assert!(artifact.filename.starts_with("invoice_list_"));
    assert!(artifact.filename.ends_with(".csv"));

    let text = String::from_utf8(artifact.bytes.clone()).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("Number,Total,Issued"));
    assert_eq!(lines.next(), Some("INV-001,\"1,234.50 €\",2024-03-01"));

    let path = artifact.path.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), artifact.bytes);

    let execution = fixture
        .store
        .get_execution(1, outcome.execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(execution.export_path, Some(path.display().to_string()));
}

#[tokio::test]
async fn test_grouped_export_matches_declared_columns() {
    let fixture = Fixture::new();
    let layout = fixture.layout(json!({
        "data_sources": {"primary": "invoices"},
        "columns": [{"field": "invoices.status", "label": "Status"}],
        "aggregations": {
            "group_by": ["invoices.status"],
            "functions": [
                {"field": "invoices.total_amount", "function": "sum", "alias": "revenue"}
            ]
        },
        "sorting": [{"field": "revenue", "direction": "desc"}]
    }));
    let definition = fixture.save(1, layout);
    let dir = tempfile::tempdir().unwrap();
    let engine = fixture
        .engine(EngineLimits::default())
        .with_exporter(Exporter::new(Some(dir.path().to_path_buf())));

    let outcome = engine
        .execute(
            &definition,
            RunRequest::ad_hoc(1, 1).with_export(ExportFormat::Csv),
        )
        .await
        .unwrap();

    assert_eq!(outcome.columns.len(), 1);
    assert_eq!(outcome.rows, vec![vec![json!("paid")], vec![json!("sent")]]);

    let text = String::from_utf8(outcome.export.unwrap().bytes).unwrap();
    assert_eq!(text.lines().collect::<Vec<_>>(), vec!["Status", "paid", "sent"]);
}

#[tokio::test]
async fn test_preview_persists_nothing() {
    let fixture = Fixture::new();
    let definition = fixture.invoice_list(1);
    let engine = fixture.engine(EngineLimits::default());

    let preview = engine.preview(&definition.layout, 1, 2).await;
    assert!(preview.success);
    assert_eq!(preview.rows_count, 2);
    assert_eq!(preview.columns.len(), 3);
    let text = preview.compiled_query_text.unwrap();
    assert!(text.contains("\"invoices\".\"organization_id\""));

    assert!(fixture
        .store
        .list_executions(1, definition.id, 10)
        .unwrap()
        .is_empty());
    let reloaded = fixture.store.get_definition(1, definition.id).unwrap().unwrap();
    assert_eq!(reloaded.execution_count, 0);
}

#[tokio::test]
async fn test_preview_reports_query_errors() {
    let fixture = Fixture::new();
    let layout = fixture.layout(json!({
        "data_sources": {"primary": "payments"},
        "columns": [{"field": "payments.amount", "label": "Amount"}]
    }));

    let preview = fixture
        .engine(EngineLimits::default())
        .preview(&layout, 1, 5)
        .await;
    assert!(!preview.success);
    assert!(preview.error.is_some());
    assert!(preview.preview_rows.is_empty());
}
