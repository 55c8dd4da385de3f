use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ReportId, ScheduleId, TenantId, UserId};

/// Lifecycle of a run. Terminal states never reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Processing => "processing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "processing" => Some(ExecutionStatus::Processing),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// pending -> processing -> completed | failed, plus pending -> failed.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    AdHoc,
    Scheduled,
}

impl ExecutionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionTrigger::AdHoc => "ad_hoc",
            ExecutionTrigger::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ad_hoc" => Some(ExecutionTrigger::AdHoc),
            "scheduled" => Some(ExecutionTrigger::Scheduled),
            _ => None,
        }
    }
}

/// Export file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Some(ExportFormat::Csv),
            "xlsx" => Some(ExportFormat::Xlsx),
            _ => None,
        }
    }
}

/// Audit record of one run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportExecution {
    pub id: Uuid,
    pub report_id: ReportId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    /// Runtime filter values as supplied.
    pub filters: BTreeMap<String, Value>,
    pub status: ExecutionStatus,
    pub trigger: ExecutionTrigger,
    pub schedule_id: Option<ScheduleId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub row_count: Option<i64>,
    /// More rows than the cap matched; output was cut.
    pub truncated: bool,
    /// Stored export file, if one was written.
    pub export_path: Option<String>,
    pub error: Option<String>,
}

/// Fields needed to open an execution record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub report_id: ReportId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub filters: BTreeMap<String, Value>,
    pub trigger: ExecutionTrigger,
    pub schedule_id: Option<ScheduleId>,
}
