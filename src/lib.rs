//! # Quarry
//!
//! A tenant-scoped engine for user-defined reports: users pick columns,
//! filters, sorting and aggregation over a fixed catalog of business data,
//! and Quarry validates, compiles, runs, exports and schedules them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        DraftConfig (user-authored JSON sections)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [validation + registry]
//! ┌─────────────────────────────────────────────────────────┐
//! │              ReportLayout (typed, checked)              │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [compiler]
//! ┌─────────────────────────────────────────────────────────┐
//! │      Tenant-scoped Query → Statement (SQL + params)     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [execution]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Bounded run → formatted rows → CSV/XLSX export        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Definitions, executions and schedules live in the [`store`]; the
//! [`scheduler`] sweeps due schedules and hands results to a delivery
//! backend. [`service::ReportService`] ties the pieces together.

pub mod advisor;
pub mod compiler;
pub mod config;
pub mod execution;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod sql;
pub mod store;
pub mod validation;

pub use compiler::{CompiledQuery, QueryCompiler};
pub use config::Settings;
pub use execution::{ExecutionEngine, RunRequest};
pub use model::{DraftConfig, ReportDefinition, ReportLayout};
pub use registry::Registry;
pub use service::ReportService;
pub use store::ReportStore;
