use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::ExportFormat;
use super::{ReportId, ScheduleId, TenantId, UserId};

/// When a schedule fires. Times are `HH:MM` in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    Daily {
        time: String,
    },
    Weekly {
        /// English weekday name, e.g. `monday`.
        day_of_week: String,
        time: String,
    },
    Monthly {
        /// 1..=31; clamped to the last day of shorter months.
        day_of_month: u32,
        time: String,
    },
    Cron {
        /// 5-field (minute precision) or 6/7-field expression.
        expression: String,
    },
}

impl Recurrence {
    pub fn kind(&self) -> &'static str {
        match self {
            Recurrence::Daily { .. } => "daily",
            Recurrence::Weekly { .. } => "weekly",
            Recurrence::Monthly { .. } => "monthly",
            Recurrence::Cron { .. } => "cron",
        }
    }
}

/// Caller-supplied schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub recurrence: Recurrence,
    /// Runtime filter values applied on every run.
    #[serde(default)]
    pub filter_preset: BTreeMap<String, Value>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub export_format: ExportFormat,
}

/// A persisted recurring run of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSchedule {
    pub id: ScheduleId,
    pub report_id: ReportId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub recurrence: Recurrence,
    pub filter_preset: BTreeMap<String, Value>,
    pub recipients: Vec<String>,
    pub export_format: ExportFormat,
    pub active: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
