use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use quarry::compiler::QueryCompiler;
use quarry::config::EngineLimits;
use quarry::execution::{ExecutionEngine, SqliteDataStore};
use quarry::model::{
    ExecutionStatus, ExecutionTrigger, ExportFormat, Recurrence, ReportDefinition, ScheduleSpec,
};
use quarry::registry::Registry;
use quarry::scheduler::{DirectoryDelivery, ScheduleError, Scheduler};
use quarry::store::ReportStore;
use quarry::validation::ConfigValidator;
use serde_json::{json, Value};

const FIXTURES: &str = "
    CREATE TABLE invoices (
        id INTEGER PRIMARY KEY,
        organization_id INTEGER NOT NULL,
        number TEXT NOT NULL,
        status TEXT,
        total_amount REAL
    );
    INSERT INTO invoices (id, organization_id, number, status, total_amount) VALUES
        (1, 1, 'INV-001', 'paid', 100.0),
        (2, 1, 'INV-002', 'sent', 200.0),
        (3, 1, 'INV-003', 'paid', 300.0),
        (4, 2, 'B-001', 'paid', 400.0);
";

struct Fixture {
    registry: Arc<Registry>,
    store: Arc<ReportStore>,
    scheduler: Scheduler,
}

impl Fixture {
    fn new(limits: EngineLimits, delivery_root: &Path) -> Self {
        let registry = Arc::new(Registry::builtin().unwrap());
        let store = Arc::new(ReportStore::open_in_memory().unwrap());
        let data = SqliteDataStore::open_in_memory().unwrap();
        data.execute_batch(FIXTURES).unwrap();

        let engine = ExecutionEngine::new(
            QueryCompiler::new(Arc::clone(&registry)),
            Arc::clone(&store),
            Arc::new(data),
            limits.clone(),
        );
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(engine), limits)
            .with_delivery(Arc::new(DirectoryDelivery::new(delivery_root)));

        Self {
            registry,
            store,
            scheduler,
        }
    }

    fn report(&self, tenant_id: i64, value: Value) -> ReportDefinition {
        let draft = serde_json::from_value(value).unwrap();
        let layout = ConfigValidator::new(Arc::clone(&self.registry), EngineLimits::default())
            .build(&draft, false)
            .unwrap();
        self.store
            .insert_definition(&ReportDefinition::new(tenant_id, 7, "Invoices", layout))
            .unwrap()
    }

    fn invoices(&self, tenant_id: i64) -> ReportDefinition {
        self.report(
            tenant_id,
            json!({
                "data_sources": {"primary": "invoices"},
                "columns": [{"field": "invoices.number", "label": "Number"}],
                "filters": [{"field": "invoices.status", "type": "select"}],
                "sorting": [{"field": "invoices.number"}]
            }),
        )
    }
}

fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn daily(time: &str) -> ScheduleSpec {
    ScheduleSpec {
        recurrence: Recurrence::Daily { time: time.into() },
        filter_preset: BTreeMap::new(),
        recipients: vec!["finance@example.com".into()],
        export_format: ExportFormat::Csv,
    }
}

#[test]
fn test_create_computes_next_run_and_flags_report() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let report = fixture.invoices(1);

    let schedule = fixture
        .scheduler
        .create_schedule(&report, 7, daily("08:00"), at(2024, 3, 1, 10, 0))
        .unwrap();
    assert_eq!(schedule.next_run_at, at(2024, 3, 2, 8, 0));
    assert!(schedule.active);
    assert!(schedule.last_run_at.is_none());

    let reloaded = fixture.store.get_definition(1, report.id).unwrap().unwrap();
    assert!(reloaded.is_scheduled);

    fixture.scheduler.deactivate_schedule(1, schedule.id).unwrap();
    let reloaded = fixture.store.get_definition(1, report.id).unwrap().unwrap();
    assert!(!reloaded.is_scheduled);
    assert!(!fixture.scheduler.get_schedule(1, schedule.id).unwrap().active);
}

#[test]
fn test_active_schedule_cap() {
    let dir = tempfile::tempdir().unwrap();
    let limits = EngineLimits {
        max_active_schedules: 1,
        ..EngineLimits::default()
    };
    let fixture = Fixture::new(limits, dir.path());
    let report = fixture.invoices(1);
    let now = at(2024, 3, 1, 10, 0);

    let first = fixture
        .scheduler
        .create_schedule(&report, 7, daily("08:00"), now)
        .unwrap();
    let err = fixture
        .scheduler
        .create_schedule(&report, 7, daily("09:00"), now)
        .unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::LimitReached {
            tenant_id: 1,
            max: 1
        }
    ));

    // Other tenants have their own budget
    let other = fixture.invoices(2);
    fixture
        .scheduler
        .create_schedule(&other, 7, daily("08:00"), now)
        .unwrap();

    // Inactive schedules do not count
    fixture.scheduler.deactivate_schedule(1, first.id).unwrap();
    fixture
        .scheduler
        .create_schedule(&report, 7, daily("09:00"), now)
        .unwrap();
}

#[test]
fn test_rejects_bad_specs() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let report = fixture.invoices(1);
    let now = at(2024, 3, 1, 10, 0);

    let mut spec = daily("08:00");
    spec.recipients = vec!["not an address".into()];
    assert!(matches!(
        fixture.scheduler.create_schedule(&report, 7, spec, now),
        Err(ScheduleError::InvalidRecipient(_))
    ));

    assert!(matches!(
        fixture.scheduler.create_schedule(&report, 7, daily("25:00"), now),
        Err(ScheduleError::InvalidTime(_))
    ));

    let mut spec = daily("08:00");
    spec.recurrence = Recurrence::Cron {
        expression: "every tuesday".into(),
    };
    assert!(matches!(
        fixture.scheduler.create_schedule(&report, 7, spec, now),
        Err(ScheduleError::InvalidCron { .. })
    ));

    assert!(fixture.scheduler.list_schedules(1, Some(report.id)).unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_runs_delivers_and_advances() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let report = fixture.invoices(1);

    let mut spec = daily("08:00");
    spec.filter_preset
        .insert("invoices.status".into(), json!("paid"));
    let schedule = fixture
        .scheduler
        .create_schedule(&report, 7, spec, at(2024, 3, 1, 10, 0))
        .unwrap();

    // Nothing due before the first run
    let summary = fixture
        .scheduler
        .execute_due(at(2024, 3, 2, 7, 59))
        .await
        .unwrap();
    assert_eq!(summary.due, 0);

    let now = at(2024, 3, 2, 8, 1);
    let summary = fixture.scheduler.execute_due(now).await.unwrap();
    assert_eq!(summary.due, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);

    let after = fixture.scheduler.get_schedule(1, schedule.id).unwrap();
    assert_eq!(after.last_run_at, Some(now));
    assert_eq!(after.next_run_at, at(2024, 3, 3, 8, 0));
    let execution_id = after.last_execution_id.unwrap();

    let execution = fixture.store.get_execution(1, execution_id).unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.trigger, ExecutionTrigger::Scheduled);
    assert_eq!(execution.schedule_id, Some(schedule.id));
    assert_eq!(execution.user_id, 7);
    assert_eq!(execution.row_count, Some(2));

    let delivered: Vec<_> = std::fs::read_dir(dir.path().join(format!("schedule_{}", schedule.id)))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(delivered.len(), 1);
    let csv = std::fs::read_to_string(&delivered[0]).unwrap();
    assert_eq!(csv, "Number\nINV-001\nINV-003\n");

    // Already advanced; a second sweep at the same instant finds nothing
    let summary = fixture.scheduler.execute_due(now).await.unwrap();
    assert_eq!(summary.due, 0);
}

#[tokio::test]
async fn test_failed_run_still_advances() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    // No customers table in the data store
    let report = fixture.report(
        1,
        json!({
            "data_sources": {"primary": "customers"},
            "columns": [{"field": "customers.name", "label": "Name"}]
        }),
    );
    let schedule = fixture
        .scheduler
        .create_schedule(&report, 7, daily("06:30"), at(2024, 3, 1, 10, 0))
        .unwrap();

    let now = at(2024, 3, 2, 7, 0);
    let summary = fixture.scheduler.execute_due(now).await.unwrap();
    assert_eq!(summary.failed, 1);

    let after = fixture.scheduler.get_schedule(1, schedule.id).unwrap();
    assert!(after.active);
    assert_eq!(after.last_run_at, Some(now));
    assert_eq!(after.next_run_at, at(2024, 3, 3, 6, 30));

    let execution = fixture
        .store
        .get_execution(1, after.last_execution_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_one_sweep_covers_every_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let created = at(2024, 3, 1, 10, 0);

    let first = fixture.invoices(1);
    let second = fixture.invoices(2);
    fixture
        .scheduler
        .create_schedule(&first, 7, daily("08:00"), created)
        .unwrap();
    fixture
        .scheduler
        .create_schedule(&second, 7, daily("08:00"), created)
        .unwrap();

    let summary = fixture
        .scheduler
        .execute_due(at(2024, 3, 2, 9, 0))
        .await
        .unwrap();
    assert_eq!(summary.due, 2);
    assert_eq!(summary.succeeded, 2);

    let rows = |tenant_id: i64, report_id: i64| {
        let executions = fixture.store.list_executions(tenant_id, report_id, 10).unwrap();
        assert_eq!(executions.len(), 1);
        executions[0].row_count
    };
    assert_eq!(rows(1, first.id), Some(3));
    assert_eq!(rows(2, second.id), Some(1));
}

#[test]
fn test_recover_stale_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let report = fixture.invoices(1);
    let schedule = fixture
        .scheduler
        .create_schedule(&report, 7, daily("08:00"), at(2024, 3, 1, 10, 0))
        .unwrap();

    // Run recorded but never advanced
    let ran = schedule.next_run_at + Duration::minutes(1);
    fixture
        .store
        .mark_schedule_run(schedule.id, None, ran)
        .unwrap();

    let now = at(2024, 3, 2, 12, 0);
    assert_eq!(fixture.scheduler.recover_stale(now).unwrap(), 1);
    let recovered = fixture.scheduler.get_schedule(1, schedule.id).unwrap();
    assert_eq!(recovered.next_run_at, at(2024, 3, 3, 8, 0));

    assert_eq!(fixture.scheduler.recover_stale(now).unwrap(), 0);
}

#[test]
fn test_update_recomputes_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(EngineLimits::default(), dir.path());
    let report = fixture.invoices(1);
    let schedule = fixture
        .scheduler
        .create_schedule(&report, 7, daily("08:00"), at(2024, 3, 1, 10, 0))
        .unwrap();

    let spec = ScheduleSpec {
        recurrence: Recurrence::Monthly {
            day_of_month: 31,
            time: "07:00".into(),
        },
        filter_preset: BTreeMap::new(),
        recipients: vec![],
        export_format: ExportFormat::Xlsx,
    };
    let updated = fixture
        .scheduler
        .update_schedule(1, schedule.id, spec, at(2024, 4, 2, 0, 0))
        .unwrap();
    // April has 30 days
    assert_eq!(updated.next_run_at, at(2024, 4, 30, 7, 0));
    assert_eq!(updated.export_format, ExportFormat::Xlsx);

    assert!(matches!(
        fixture.scheduler.update_schedule(2, schedule.id, daily("08:00"), Utc::now()),
        Err(ScheduleError::ScheduleNotFound(_))
    ));
}
