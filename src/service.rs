//! Application-facing report operations.
//!
//! [`ReportService`] wires the registry, validator, compiler, advisor,
//! engine, scheduler and store together and exposes the operations the
//! surrounding application calls. Every operation takes the tenant id and
//! never reaches rows of another tenant.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::advisor::{Analysis, QueryAdvisor};
use crate::compiler::{OutputColumn, QueryCompiler};
use crate::config::{EngineLimits, Settings, SettingsError};
use crate::execution::{
    CellFormatter, DataStore, DataStoreError, ExecutionEngine, ExecutionFailure, ExportArtifact,
    Exporter, PreviewResult, RunRequest, SqliteDataStore,
};
use crate::model::{
    DraftConfig, ReportDefinition, ReportExecution, ReportId, ReportSchedule, ScheduleId,
    ScheduleSpec, TenantId, UserId,
};
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{
    DirectoryDelivery, LogDelivery, ReportDelivery, ScheduleError, Scheduler,
};
use crate::store::{ReportStore, StoreError};
use crate::validation::{ConfigError, ConfigValidator};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Report configuration is invalid ({} problems)", .0.len())]
    Validation(Vec<ConfigError>),

    #[error("Report {0} not found")]
    ReportNotFound(ReportId),

    #[error(transparent)]
    Execution(#[from] ExecutionFailure),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Run metadata returned alongside rows.
#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub rows_count: usize,
    pub execution_time_ms: i64,
    pub execution_id: Uuid,
    pub truncated: bool,
}

/// Response of [`ReportService::run_report`].
#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub success: bool,
    pub columns: Vec<OutputColumn>,
    pub data: Vec<Vec<Value>>,
    pub meta: RunMeta,
    /// Present when an export format was requested.
    #[serde(skip)]
    pub export: Option<ExportArtifact>,
}

pub struct ReportService {
    validator: ConfigValidator,
    advisor: QueryAdvisor,
    store: Arc<ReportStore>,
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<Scheduler>,
    limits: EngineLimits,
}

impl ReportService {
    /// Assemble a service from explicit parts; `settings` supplies limits
    /// and engine/scheduler behaviour.
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<ReportStore>,
        data: Arc<dyn DataStore>,
        settings: &Settings,
    ) -> ServiceResult<Self> {
        let limits = settings.limits.clone();

        let engine = ExecutionEngine::new(
            QueryCompiler::new(Arc::clone(&registry)),
            Arc::clone(&store),
            data,
            limits.clone(),
        )
        .with_formatter(CellFormatter::new(settings.format.currency_suffix.clone()))
        .with_exporter(Exporter::new(settings.export_dir()?))
        .count_failed_attempts(settings.execution.count_failed_attempts);
        let engine = Arc::new(engine);

        let delivery: Arc<dyn ReportDelivery> = match settings.delivery_dir()? {
            Some(dir) => Arc::new(DirectoryDelivery::new(dir)),
            None => Arc::new(LogDelivery),
        };
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&engine), limits.clone())
            .with_delivery(delivery)
            .with_concurrency(settings.scheduler.max_concurrency)
            .with_tick(std::time::Duration::from_secs(settings.scheduler.tick_secs));

        Ok(Self {
            validator: ConfigValidator::new(Arc::clone(&registry), limits.clone()),
            advisor: QueryAdvisor::new(registry, limits.clone()),
            store,
            engine,
            scheduler: Arc::new(scheduler),
            limits,
        })
    }

    /// Open the catalog, store and data database named in `settings`.
    pub fn from_settings(settings: &Settings) -> ServiceResult<Self> {
        let registry = match settings.catalog_path()? {
            Some(path) => Registry::from_file(path)?,
            None => Registry::builtin()?,
        };
        let store = ReportStore::open(settings.database_path()?)?;
        let data = SqliteDataStore::open(settings.data_path()?)?;
        Self::new(Arc::new(registry), Arc::new(store), Arc::new(data), settings)
    }

    pub fn validator(&self) -> &ConfigValidator {
        &self.validator
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        Arc::clone(&self.engine)
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Validate a draft in full and save it as a new definition.
    pub fn save_report(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        draft: &DraftConfig,
    ) -> ServiceResult<ReportDefinition> {
        let layout = self
            .validator
            .build(draft, true)
            .map_err(ServiceError::Validation)?;

        let mut definition =
            ReportDefinition::new(tenant_id, user_id, draft.name.clone().unwrap_or_default(), layout);
        definition.description = draft.description.clone();
        definition.category = draft.category.clone();
        definition.is_shared = draft.is_shared;
        definition.is_favorite = draft.is_favorite;

        let saved = self.store.insert_definition(&definition)?;
        info!(tenant_id, report_id = saved.id, name = %saved.name, "report saved");
        Ok(saved)
    }

    /// Validate a draft and run it against a small preview limit without
    /// persisting anything.
    pub async fn test_report(
        &self,
        tenant_id: TenantId,
        draft: &DraftConfig,
    ) -> ServiceResult<PreviewResult> {
        let layout = self
            .validator
            .build(draft, false)
            .map_err(ServiceError::Validation)?;
        Ok(self
            .engine
            .preview(&layout, tenant_id, self.limits.preview_limit)
            .await)
    }

    /// Run a saved report.
    pub async fn run_report(
        &self,
        report_id: ReportId,
        request: RunRequest,
    ) -> ServiceResult<RunResponse> {
        let definition = self.get_report(request.tenant_id, report_id)?;
        let outcome = self.engine.execute(&definition, request).await?;
        Ok(RunResponse {
            success: true,
            meta: RunMeta {
                rows_count: outcome.row_count,
                execution_time_ms: outcome.duration_ms,
                execution_id: outcome.execution_id,
                truncated: outcome.truncated,
            },
            columns: outcome.columns,
            data: outcome.rows,
            export: outcome.export,
        })
    }

    /// Replace a definition's metadata and layout.
    pub fn update_report(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
        draft: &DraftConfig,
    ) -> ServiceResult<ReportDefinition> {
        let layout = self
            .validator
            .build(draft, true)
            .map_err(ServiceError::Validation)?;
        let mut definition = self.get_report(tenant_id, report_id)?;

        definition.name = draft.name.clone().unwrap_or_default();
        definition.description = draft.description.clone();
        definition.category = draft.category.clone();
        definition.is_shared = draft.is_shared;
        definition.is_favorite = draft.is_favorite;
        definition.layout = layout;

        Ok(self.store.update_definition(&definition)?)
    }

    /// Delete a definition and its schedules. Execution history is kept.
    pub fn delete_report(&self, tenant_id: TenantId, report_id: ReportId) -> ServiceResult<()> {
        if !self.store.delete_definition(tenant_id, report_id)? {
            return Err(ServiceError::ReportNotFound(report_id));
        }
        info!(tenant_id, report_id, "report deleted");
        Ok(())
    }

    /// Reports the user owns plus those shared within the tenant.
    pub fn list_reports(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> ServiceResult<Vec<ReportDefinition>> {
        Ok(self.store.list_definitions(tenant_id, user_id)?)
    }

    pub fn get_report(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
    ) -> ServiceResult<ReportDefinition> {
        self.store
            .get_definition(tenant_id, report_id)?
            .ok_or(ServiceError::ReportNotFound(report_id))
    }

    /// Copy a report for `user_id`. The copy starts private, unscheduled
    /// and with fresh counters.
    pub fn clone_report(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        report_id: ReportId,
        name: Option<String>,
    ) -> ServiceResult<ReportDefinition> {
        let source = self.get_report(tenant_id, report_id)?;
        let name = name.unwrap_or_else(|| format!("{} (copy)", source.name));

        let mut copy = ReportDefinition::new(tenant_id, user_id, name, source.layout);
        copy.description = source.description;
        copy.category = source.category;

        Ok(self.store.insert_definition(&copy)?)
    }

    pub fn set_default(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
    ) -> ServiceResult<ReportDefinition> {
        self.get_report(tenant_id, report_id)?;
        Ok(self.store.set_default(tenant_id, report_id)?)
    }

    /// Returns the new favorite state.
    pub fn toggle_favorite(&self, tenant_id: TenantId, report_id: ReportId) -> ServiceResult<bool> {
        self.get_report(tenant_id, report_id)?;
        Ok(self.store.toggle_favorite(tenant_id, report_id)?)
    }

    pub fn analyze_report(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
    ) -> ServiceResult<Analysis> {
        let definition = self.get_report(tenant_id, report_id)?;
        Ok(self.advisor.analyze(&definition.layout))
    }

    pub fn list_executions(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
        limit: u32,
    ) -> ServiceResult<Vec<ReportExecution>> {
        Ok(self.store.list_executions(tenant_id, report_id, limit)?)
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    pub fn create_schedule(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        report_id: ReportId,
        spec: ScheduleSpec,
    ) -> ServiceResult<ReportSchedule> {
        let definition = self.get_report(tenant_id, report_id)?;
        Ok(self
            .scheduler
            .create_schedule(&definition, user_id, spec, Utc::now())?)
    }

    pub fn update_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
        spec: ScheduleSpec,
    ) -> ServiceResult<ReportSchedule> {
        Ok(self
            .scheduler
            .update_schedule(tenant_id, schedule_id, spec, Utc::now())?)
    }

    pub fn deactivate_schedule(
        &self,
        tenant_id: TenantId,
        schedule_id: ScheduleId,
    ) -> ServiceResult<()> {
        Ok(self.scheduler.deactivate_schedule(tenant_id, schedule_id)?)
    }

    pub fn delete_schedule(&self, tenant_id: TenantId, schedule_id: ScheduleId) -> ServiceResult<()> {
        Ok(self.scheduler.delete_schedule(tenant_id, schedule_id)?)
    }

    pub fn list_schedules(
        &self,
        tenant_id: TenantId,
        report_id: Option<ReportId>,
    ) -> ServiceResult<Vec<ReportSchedule>> {
        Ok(self.scheduler.list_schedules(tenant_id, report_id)?)
    }
}

/// Runtime filter values from a JSON object. Anything else yields no filters.
pub fn filters_from_json(value: &Value) -> BTreeMap<String, Value> {
    value
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
