//! Recurring report runs.
//!
//! A sweep picks every active schedule whose `next_run_at` has passed,
//! runs them concurrently (bounded), and for each one:
//!
//! 1. executes the report with the schedule's filter preset and export format
//! 2. records the run and its execution id on the schedule
//! 3. hands the result to the configured [`ReportDelivery`]
//! 4. computes and stores the next run from the sweep time
//!
//! Steps 2 and 4 are separate writes. A crash between them leaves a schedule
//! whose `next_run_at` is not after its `last_run_at`; [`Scheduler::recover_stale`]
//! finds those and recomputes from the current time.

mod delivery;
mod recurrence;

pub use delivery::{Delivery, DeliveryError, DirectoryDelivery, LogDelivery, ReportDelivery};
pub use recurrence::{
    compute_next_run, next_daily, next_monthly, next_weekly, validate_recurrence,
};

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineLimits;
use crate::execution::{ExecutionEngine, RunRequest};
use crate::model::{ReportDefinition, ReportId, ReportSchedule, ScheduleId, ScheduleSpec, TenantId, UserId};
use crate::store::{ReportStore, StoreError};

static RECIPIENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid time '{0}': expected HH:MM")]
    InvalidTime(String),

    #[error("Invalid day of week '{0}'")]
    InvalidWeekday(String),

    #[error("Invalid day of month {0}: expected 1-31")]
    InvalidDayOfMonth(u32),

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("Cron expression '{0}' has no upcoming run")]
    NoUpcomingRun(String),

    #[error("Invalid recipient '{0}'")]
    InvalidRecipient(String),

    #[error("Tenant {tenant_id} already has {max} active schedules")]
    LimitReached { tenant_id: TenantId, max: usize },

    #[error("Schedule {0} not found")]
    ScheduleNotFound(ScheduleId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    store: Arc<ReportStore>,
    engine: Arc<ExecutionEngine>,
    delivery: Arc<dyn ReportDelivery>,
    limits: EngineLimits,
    max_concurrency: usize,
    tick: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<ReportStore>, engine: Arc<ExecutionEngine>, limits: EngineLimits) -> Self {
        Self {
            store,
            engine,
            delivery: Arc::new(LogDelivery),
            limits,
            max_concurrency: 4,
            tick: Duration::from_secs(60),
        }
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn ReportDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Attach a schedule to `definition`. The tenant's active schedule cap
    /// applies.
    pub fn create_schedule(
        &self,
        definition: &ReportDefinition,
        user_id: UserId,
        spec: ScheduleSpec,
        now: DateTime<Utc>,
    ) -> ScheduleResult<ReportSchedule> {
        check_spec(&spec)?;

        let next_run_at = compute_next_run(&spec.recurrence, now)?;
        let max = self.limits.max_active_schedules;
        let created = self.store.insert_schedule_within_cap(
            &ReportSchedule {
                id: 0,
                report_id: definition.id,
                tenant_id: definition.tenant_id,
                user_id,
                recurrence: spec.recurrence,
                filter_preset: spec.filter_preset,
                recipients: spec.recipients,
                export_format: spec.export_format,
                active: true,
                next_run_at,
                last_run_at: None,
                last_execution_id: None,
                created_at: now,
                updated_at: now,
            },
            max,
        )?;
        let Some(schedule) = created else {
            return Err(ScheduleError::LimitReached {
                tenant_id: definition.tenant_id,
                max,
            });
        };
        self.store
            .refresh_scheduled_flag(definition.tenant_id, definition.id)?;

        info!(
            schedule_id = schedule.id,
            tenant_id = schedule.tenant_id,
            report_id = schedule.report_id,
            recurrence = schedule.recurrence.kind(),
            next_run_at = %schedule.next_run_at,
            "schedule created"
        );
        Ok(schedule)
    }

    /// Replace a schedule's settings and recompute its next run from `now`.
    pub fn update_schedule(
        &self,
        tenant_id: TenantId,
        id: ScheduleId,
        spec: ScheduleSpec,
        now: DateTime<Utc>,
    ) -> ScheduleResult<ReportSchedule> {
        check_spec(&spec)?;
        let mut schedule = self.get_schedule(tenant_id, id)?;

        schedule.next_run_at = compute_next_run(&spec.recurrence, now)?;
        schedule.recurrence = spec.recurrence;
        schedule.filter_preset = spec.filter_preset;
        schedule.recipients = spec.recipients;
        schedule.export_format = spec.export_format;

        Ok(self.store.update_schedule(&schedule)?)
    }

    /// Stop a schedule. Its run history is kept.
    pub fn deactivate_schedule(&self, tenant_id: TenantId, id: ScheduleId) -> ScheduleResult<()> {
        let schedule = self.get_schedule(tenant_id, id)?;
        self.store.set_schedule_active(tenant_id, id, false)?;
        self.store
            .refresh_scheduled_flag(tenant_id, schedule.report_id)?;
        info!(schedule_id = id, tenant_id, "schedule deactivated");
        Ok(())
    }

    pub fn delete_schedule(&self, tenant_id: TenantId, id: ScheduleId) -> ScheduleResult<()> {
        let schedule = self.get_schedule(tenant_id, id)?;
        self.store.delete_schedule(tenant_id, id)?;
        self.store
            .refresh_scheduled_flag(tenant_id, schedule.report_id)?;
        info!(schedule_id = id, tenant_id, "schedule deleted");
        Ok(())
    }

    pub fn get_schedule(&self, tenant_id: TenantId, id: ScheduleId) -> ScheduleResult<ReportSchedule> {
        self.store
            .get_schedule(tenant_id, id)?
            .ok_or(ScheduleError::ScheduleNotFound(id))
    }

    pub fn list_schedules(
        &self,
        tenant_id: TenantId,
        report_id: Option<ReportId>,
    ) -> ScheduleResult<Vec<ReportSchedule>> {
        Ok(self.store.list_schedules(tenant_id, report_id)?)
    }

    pub fn due_schedules(&self, now: DateTime<Utc>) -> ScheduleResult<Vec<ReportSchedule>> {
        Ok(self.store.due_schedules(now)?)
    }

    /// Run every schedule due at `now`. One schedule failing never stops
    /// the others.
    pub async fn execute_due(&self, now: DateTime<Utc>) -> ScheduleResult<SweepSummary> {
        let due = self.store.due_schedules(now)?;
        if due.is_empty() {
            debug!("no schedules due");
            return Ok(SweepSummary::default());
        }
        info!(count = due.len(), "running due schedules");

        let results: Vec<bool> = stream::iter(due.iter())
            .map(|schedule| self.run_schedule(schedule, now))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let succeeded = results.iter().filter(|ok| **ok).count();
        let summary = SweepSummary {
            due: due.len(),
            succeeded,
            failed: due.len() - succeeded,
        };
        info!(
            due = summary.due,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "schedule sweep finished"
        );
        Ok(summary)
    }

    /// Reschedule from `now` every schedule that ran but was never advanced.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> ScheduleResult<usize> {
        let stale = self.store.stale_schedules(now)?;
        for schedule in &stale {
            warn!(
                schedule_id = schedule.id,
                next_run_at = %schedule.next_run_at,
                "recovering stale schedule"
            );
            self.advance(schedule, now);
        }
        Ok(stale.len())
    }

    /// Sweep on every tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        if let Err(e) = self.recover_stale(Utc::now()) {
            error!(error = %e, "stale schedule recovery failed");
        }

        let mut ticker = tokio::time::interval(self.tick);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.execute_due(Utc::now()).await {
                        error!(error = %e, "schedule sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Execute, record, deliver, then advance one schedule. Returns whether
    /// the run and its delivery succeeded.
    async fn run_schedule(&self, schedule: &ReportSchedule, now: DateTime<Utc>) -> bool {
        let definition = match self.store.get_definition(schedule.tenant_id, schedule.report_id) {
            Ok(Some(definition)) => definition,
            Ok(None) => {
                warn!(
                    schedule_id = schedule.id,
                    report_id = schedule.report_id,
                    "scheduled report no longer exists"
                );
                self.advance(schedule, now);
                return false;
            }
            Err(e) => {
                error!(schedule_id = schedule.id, error = %e, "could not load scheduled report");
                self.advance(schedule, now);
                return false;
            }
        };

        let request = RunRequest::scheduled(schedule.tenant_id, schedule.user_id, schedule.id)
            .with_filters(schedule.filter_preset.clone())
            .with_export(schedule.export_format);

        let (execution_id, ok) = match self.engine.execute(&definition, request).await {
            Ok(outcome) => {
                let delivered = self
                    .delivery
                    .deliver(Delivery {
                        schedule,
                        report_name: &definition.name,
                        row_count: outcome.row_count,
                        truncated: outcome.truncated,
                        artifact: outcome.export.as_ref(),
                    })
                    .await;
                if let Err(e) = &delivered {
                    warn!(schedule_id = schedule.id, error = %e, "delivery failed");
                }
                (Some(outcome.execution_id), delivered.is_ok())
            }
            Err(failure) => {
                warn!(
                    schedule_id = schedule.id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "scheduled execution failed"
                );
                (failure.execution_id, false)
            }
        };

        if let Err(e) = self.store.mark_schedule_run(schedule.id, execution_id, now) {
            error!(schedule_id = schedule.id, error = %e, "could not record schedule run");
        }
        self.advance(schedule, now);
        ok
    }

    /// Store the next run computed from `now`. A recurrence that can no
    /// longer produce a run deactivates the schedule.
    fn advance(&self, schedule: &ReportSchedule, now: DateTime<Utc>) {
        match compute_next_run(&schedule.recurrence, now) {
            Ok(next) => {
                if let Err(e) = self.store.reschedule(schedule.id, next) {
                    error!(schedule_id = schedule.id, error = %e, "could not reschedule");
                }
            }
            Err(e) => {
                error!(schedule_id = schedule.id, error = %e, "deactivating schedule with unusable recurrence");
                let result = self
                    .store
                    .set_schedule_active(schedule.tenant_id, schedule.id, false)
                    .and_then(|_| {
                        self.store
                            .refresh_scheduled_flag(schedule.tenant_id, schedule.report_id)
                    });
                if let Err(e) = result {
                    error!(schedule_id = schedule.id, error = %e, "could not deactivate schedule");
                }
            }
        }
    }
}

fn check_spec(spec: &ScheduleSpec) -> ScheduleResult<()> {
    validate_recurrence(&spec.recurrence)?;
    match spec.recipients.iter().find(|r| !RECIPIENT.is_match(r)) {
        Some(bad) => Err(ScheduleError::InvalidRecipient(bad.clone())),
        None => Ok(()),
    }
}
