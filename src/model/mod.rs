//! Report model types.
//!
//! - [`DraftConfig`] is the loose, user-authored input (JSON sections).
//! - [`ReportLayout`] is the typed form, built only by the validator.
//! - [`ReportDefinition`] is the persisted, tenant-owned record.
//! - [`ReportExecution`] and [`ReportSchedule`] reference a definition by id.

pub mod definition;
pub mod draft;
pub mod execution;
mod hash;
pub mod layout;
pub mod schedule;

pub use definition::{layout_hash, ReportDefinition};
pub use draft::DraftConfig;
pub use hash::compute_hash;
pub use execution::{
    ExecutionStatus, ExecutionTrigger, ExportFormat, NewExecution, ReportExecution,
};
pub use layout::{
    AggregateFunction, Aggregation, AggregationSpec, Column, ColumnExpr, ColumnFormat, FieldRef,
    FilterSlot, FilterType, JoinKind, JoinSpec, ReportLayout, ScalarFunction, SortDirection,
    SortSpec, SortTarget, SourceSpec,
};
pub use schedule::{Recurrence, ReportSchedule, ScheduleSpec};

/// Owning tenant (organization) id.
pub type TenantId = i64;

/// Acting user id.
pub type UserId = i64;

/// Persisted report definition id.
pub type ReportId = i64;

/// Persisted schedule id.
pub type ScheduleId = i64;
