//! Bounded report execution with an audit trail.
//!
//! # Run lifecycle
//!
//! ```text
//! create (pending) -> processing -> compile -> query -> format -> export? -> completed
//!                                       \________________________________/
//!                                                     failed
//! ```
//!
//! Every run is recorded in the store before anything else happens, so each
//! attempt leaves exactly one execution row in a terminal state (unless the
//! store itself is unreachable). Queries fetch one row past the cap to detect
//! truncation and run on the blocking pool under a deadline.

mod datastore;
mod export;
mod format;

pub use datastore::{
    CancelHandle, DataStore, DataStoreError, DataStoreResult, RowSet, RunGuard, SqliteDataStore,
    Watchdog,
};
pub use export::{export_filename, ExportArtifact, ExportError, ExportResult, Exporter};
pub use format::CellFormatter;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compiler::{CompiledQuery, OutputColumn, QueryCompiler};
use crate::config::EngineLimits;
use crate::model::{
    ColumnFormat, ExecutionTrigger, ExportFormat, NewExecution, ReportDefinition, ReportLayout,
    ScheduleId, TenantId, UserId,
};
use crate::store::{ExecutionResult, ReportStore, StoreError};

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Runtime filter values keyed by `source.field`.
    pub filters: BTreeMap<String, Value>,
    pub export: Option<ExportFormat>,
    pub trigger: ExecutionTrigger,
    pub schedule_id: Option<ScheduleId>,
    pub cancel: CancelHandle,
}

impl RunRequest {
    pub fn ad_hoc(tenant_id: TenantId, user_id: UserId) -> Self {
        Self {
            tenant_id,
            user_id,
            filters: BTreeMap::new(),
            export: None,
            trigger: ExecutionTrigger::AdHoc,
            schedule_id: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn scheduled(tenant_id: TenantId, user_id: UserId, schedule_id: ScheduleId) -> Self {
        Self {
            trigger: ExecutionTrigger::Scheduled,
            schedule_id: Some(schedule_id),
            ..Self::ad_hoc(tenant_id, user_id)
        }
    }

    pub fn with_filters(mut self, filters: BTreeMap<String, Value>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_export(mut self, format: ExportFormat) -> Self {
        self.export = Some(format);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub columns: Vec<OutputColumn>,
    /// Formatted cells, one entry per column.
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub duration_ms: i64,
    /// More rows matched than the cap allowed.
    pub truncated: bool,
    pub export: Option<ExportArtifact>,
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Compile,
    Timeout,
    Cancelled,
    DataStore,
    Export,
    Store,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Compile => "compile",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DataStore => "data_store",
            FailureKind::Export => "export",
            FailureKind::Store => "store",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed run. Never carries SQL text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Execution failed ({kind}): {message}")]
pub struct ExecutionFailure {
    /// `None` only when the execution record itself could not be created.
    pub execution_id: Option<Uuid>,
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    fn new(execution_id: Option<Uuid>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            kind,
            message: message.into(),
        }
    }
}

impl From<DataStoreError> for FailureKind {
    fn from(err: DataStoreError) -> Self {
        FailureKind::from(&err)
    }
}

impl From<&DataStoreError> for FailureKind {
    fn from(err: &DataStoreError) -> Self {
        match err {
            DataStoreError::Timeout(_) => FailureKind::Timeout,
            DataStoreError::Cancelled => FailureKind::Cancelled,
            DataStoreError::Sqlite(_) | DataStoreError::LockPoisoned => FailureKind::DataStore,
        }
    }
}

/// Result of a test run. Nothing is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub success: bool,
    pub rows_count: usize,
    pub execution_time_ms: i64,
    pub columns: Vec<OutputColumn>,
    pub preview_rows: Vec<Vec<Value>>,
    pub compiled_query_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// Runs compiled reports against a [`DataStore`].
pub struct ExecutionEngine {
    compiler: QueryCompiler,
    store: Arc<ReportStore>,
    data: Arc<dyn DataStore>,
    limits: EngineLimits,
    formatter: CellFormatter,
    exporter: Exporter,
    count_failed_attempts: bool,
}

impl ExecutionEngine {
    pub fn new(
        compiler: QueryCompiler,
        store: Arc<ReportStore>,
        data: Arc<dyn DataStore>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            compiler,
            store,
            data,
            limits,
            formatter: CellFormatter::default(),
            exporter: Exporter::default(),
            count_failed_attempts: true,
        }
    }

    pub fn with_formatter(mut self, formatter: CellFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = exporter;
        self
    }

    /// Whether a run that compiled but then failed still counts toward the
    /// definition's execution counter.
    pub fn count_failed_attempts(mut self, enabled: bool) -> Self {
        self.count_failed_attempts = enabled;
        self
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Run `definition` for the request's tenant and record the attempt.
    pub async fn execute(
        &self,
        definition: &ReportDefinition,
        request: RunRequest,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let execution = self
            .store
            .create_execution(&NewExecution {
                report_id: definition.id,
                user_id: request.user_id,
                tenant_id: request.tenant_id,
                filters: request.filters.clone(),
                trigger: request.trigger,
                schedule_id: request.schedule_id,
            })
            .map_err(|e| ExecutionFailure::new(None, FailureKind::Store, e.to_string()))?;
        let execution_id = execution.id;
        let started = Instant::now();

        info!(
            %execution_id,
            tenant_id = request.tenant_id,
            report_id = definition.id,
            trigger = request.trigger.as_str(),
            "report execution started"
        );

        match self.run(definition, &request, execution_id).await {
            Ok(outcome) => {
                info!(
                    %execution_id,
                    rows = outcome.row_count,
                    truncated = outcome.truncated,
                    duration_ms = outcome.duration_ms,
                    "report execution completed"
                );
                Ok(outcome)
            }
            Err(failure) => {
                let duration_ms = elapsed_ms(started);
                warn!(
                    %execution_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "report execution failed"
                );
                if let Err(e) = self
                    .store
                    .mark_failed(execution_id, &failure.message, Some(duration_ms))
                {
                    warn!(%execution_id, error = %e, "could not record execution failure");
                }
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        definition: &ReportDefinition,
        request: &RunRequest,
        execution_id: Uuid,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let fail = |kind: FailureKind, message: String| {
            ExecutionFailure::new(Some(execution_id), kind, message)
        };
        let started = Instant::now();

        self.store
            .mark_processing(execution_id)
            .map_err(|e| fail(FailureKind::Store, e.to_string()))?;

        let compiled = self
            .compiler
            .compile(definition, request.tenant_id)
            .map_err(|e| fail(FailureKind::Compile, e.to_string()))?;

        if self.count_failed_attempts {
            self.record_attempt(definition);
        }

        let compiled = self
            .compiler
            .apply_user_filters(compiled, &request.filters, &definition.layout);
        let columns = compiled.columns().to_vec();
        let cap = self.limits.row_cap;

        let RowSet { mut rows, .. } = self
            .fetch(compiled.with_limit(cap as u64 + 1), request.cancel.clone())
            .await
            .map_err(|(kind, message)| fail(kind, message))?;

        let truncated = rows.len() > cap;
        rows.truncate(cap);
        let formats: Vec<ColumnFormat> = columns.iter().map(|c| c.format).collect();
        self.formatter.format_rows(&mut rows, &formats);

        let export = match request.export {
            Some(format) => Some(
                self.exporter
                    .export(&definition.name, &columns, &rows, format, Utc::now())
                    .map_err(|e| fail(FailureKind::Export, e.to_string()))?,
            ),
            None => None,
        };

        let duration_ms = elapsed_ms(started);
        let result = ExecutionResult {
            row_count: rows.len() as i64,
            duration_ms,
            truncated,
            export_path: export
                .as_ref()
                .and_then(|a| a.path.as_ref())
                .map(|p| p.display().to_string()),
        };
        self.store
            .mark_completed(execution_id, &result)
            .map_err(|e| fail(FailureKind::Store, e.to_string()))?;

        if !self.count_failed_attempts {
            self.record_attempt(definition);
        }

        Ok(ExecutionOutcome {
            execution_id,
            row_count: rows.len(),
            columns,
            rows,
            duration_ms,
            truncated,
            export,
        })
    }

    /// Compile and run `layout` without touching the store.
    pub async fn preview(
        &self,
        layout: &ReportLayout,
        tenant_id: TenantId,
        limit: usize,
    ) -> PreviewResult {
        let started = Instant::now();
        let compiled = match self.compiler.compile_layout(layout, tenant_id) {
            Ok(compiled) => compiled.with_limit(limit as u64),
            Err(e) => {
                return PreviewResult {
                    success: false,
                    rows_count: 0,
                    execution_time_ms: elapsed_ms(started),
                    columns: Vec::new(),
                    preview_rows: Vec::new(),
                    compiled_query_text: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let columns = compiled.columns().to_vec();
        let sql_text = compiled.sql_text();

        match self.fetch(compiled, CancelHandle::new()).await {
            Ok(RowSet { mut rows, .. }) => {
                rows.truncate(limit);
                let formats: Vec<ColumnFormat> = columns.iter().map(|c| c.format).collect();
                self.formatter.format_rows(&mut rows, &formats);
                PreviewResult {
                    success: true,
                    rows_count: rows.len(),
                    execution_time_ms: elapsed_ms(started),
                    columns,
                    preview_rows: rows,
                    compiled_query_text: Some(sql_text),
                    error: None,
                }
            }
            Err((_, message)) => PreviewResult {
                success: false,
                rows_count: 0,
                execution_time_ms: elapsed_ms(started),
                columns,
                preview_rows: Vec::new(),
                compiled_query_text: Some(sql_text),
                error: Some(message),
            },
        }
    }

    /// Run a compiled query on the blocking pool under the configured
    /// timeout. The store starts the clock once it holds a connection.
    async fn fetch(
        &self,
        compiled: CompiledQuery,
        cancel: CancelHandle,
    ) -> Result<RowSet, (FailureKind, String)> {
        let data = Arc::clone(&self.data);
        let statement = compiled.statement(data.dialect());
        let guard = RunGuard::new(self.limits.query_timeout(), cancel);
        debug!(params = statement.param_count(), "running report query");

        tokio::task::spawn_blocking(move || data.query(&statement, &guard))
            .await
            .map_err(|e| (FailureKind::Internal, format!("query task failed: {}", e)))?
            .map_err(|e| (FailureKind::from(&e), e.to_string()))
    }

    fn record_attempt(&self, definition: &ReportDefinition) {
        if let Err(e) =
            self.store
                .record_execution_attempt(definition.tenant_id, definition.id, Utc::now())
        {
            match e {
                StoreError::NotFound { .. } => {
                    debug!(report_id = definition.id, "unsaved report; no counters to update")
                }
                other => warn!(report_id = definition.id, error = %other, "could not update execution counters"),
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
