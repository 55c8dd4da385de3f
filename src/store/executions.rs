//! Execution audit records.
//!
//! Rows are only ever inserted and moved forward through their status
//! lifecycle; nothing here deletes them.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    enum_col, json_col, opt_ts_col, ts, ts_col, uuid_col, ReportStore, StoreError, StoreResult,
};
use crate::model::{
    ExecutionStatus, ExecutionTrigger, NewExecution, ReportExecution, ReportId, TenantId,
};

/// Outcome written when a run completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub row_count: i64,
    pub duration_ms: i64,
    pub truncated: bool,
    pub export_path: Option<String>,
}

const COLUMNS: &str = "id, report_id, user_id, tenant_id, filters, status, triggered_by, \
     schedule_id, created_at, started_at, completed_at, duration_ms, row_count, truncated, \
     export_path, error";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ReportExecution> {
    Ok(ReportExecution {
        id: uuid_col(row, 0)?,
        report_id: row.get(1)?,
        user_id: row.get(2)?,
        tenant_id: row.get(3)?,
        filters: json_col(row, 4)?,
        status: enum_col(row, 5, "execution status", ExecutionStatus::parse)?,
        trigger: enum_col(row, 6, "execution trigger", ExecutionTrigger::parse)?,
        schedule_id: row.get(7)?,
        created_at: ts_col(row, 8)?,
        started_at: opt_ts_col(row, 9)?,
        completed_at: opt_ts_col(row, 10)?,
        duration_ms: row.get(11)?,
        row_count: row.get(12)?,
        truncated: row.get(13)?,
        export_path: row.get(14)?,
        error: row.get(15)?,
    })
}

fn not_found(id: Uuid) -> StoreError {
    StoreError::NotFound {
        kind: "execution",
        id: id.to_string(),
    }
}

/// Check that `id` may move to `next`, under the caller's lock.
fn check_transition(conn: &Connection, id: Uuid, next: ExecutionStatus) -> StoreResult<()> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM report_executions WHERE id = ?",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let status = status.ok_or_else(|| not_found(id))?;
    let current = ExecutionStatus::parse(&status).ok_or_else(|| not_found(id))?;

    if !current.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id,
            from: current,
            to: next,
        });
    }
    Ok(())
}

impl ReportStore {
    /// Open a pending execution record.
    pub fn create_execution(&self, new: &NewExecution) -> StoreResult<ReportExecution> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO report_executions (
                id, report_id, user_id, tenant_id, filters, status, triggered_by,
                schedule_id, created_at, truncated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            params![
                id.to_string(),
                new.report_id,
                new.user_id,
                new.tenant_id,
                serde_json::to_string(&new.filters)?,
                ExecutionStatus::Pending.as_str(),
                new.trigger.as_str(),
                new.schedule_id,
                ts(now),
            ],
        )?;

        Ok(ReportExecution {
            id,
            report_id: new.report_id,
            user_id: new.user_id,
            tenant_id: new.tenant_id,
            filters: new.filters.clone(),
            status: ExecutionStatus::Pending,
            trigger: new.trigger,
            schedule_id: new.schedule_id,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            row_count: None,
            truncated: false,
            export_path: None,
            error: None,
        })
    }

    pub fn get_execution(
        &self,
        tenant_id: TenantId,
        id: Uuid,
    ) -> StoreResult<Option<ReportExecution>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM report_executions WHERE tenant_id = ? AND id = ?",
            COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![tenant_id, id.to_string()], from_row)
            .optional()?)
    }

    /// Most recent executions of a report, newest first.
    pub fn list_executions(
        &self,
        tenant_id: TenantId,
        report_id: ReportId,
        limit: u32,
    ) -> StoreResult<Vec<ReportExecution>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM report_executions
             WHERE tenant_id = ? AND report_id = ?
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params![tenant_id, report_id, limit], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    pub fn mark_processing(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.conn()?;
        check_transition(&conn, id, ExecutionStatus::Processing)?;
        conn.execute(
            "UPDATE report_executions SET status = ?, started_at = ? WHERE id = ?",
            params![
                ExecutionStatus::Processing.as_str(),
                ts(Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn mark_completed(&self, id: Uuid, result: &ExecutionResult) -> StoreResult<()> {
        let conn = self.conn()?;
        check_transition(&conn, id, ExecutionStatus::Completed)?;
        conn.execute(
            "UPDATE report_executions SET
                status = ?, completed_at = ?, duration_ms = ?, row_count = ?,
                truncated = ?, export_path = ?
             WHERE id = ?",
            params![
                ExecutionStatus::Completed.as_str(),
                ts(Utc::now()),
                result.duration_ms,
                result.row_count,
                result.truncated,
                result.export_path,
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: Uuid, error: &str, duration_ms: Option<i64>) -> StoreResult<()> {
        let conn = self.conn()?;
        check_transition(&conn, id, ExecutionStatus::Failed)?;
        conn.execute(
            "UPDATE report_executions SET
                status = ?, completed_at = ?, duration_ms = ?, error = ?
             WHERE id = ?",
            params![
                ExecutionStatus::Failed.as_str(),
                ts(Utc::now()),
                duration_ms,
                error,
                id.to_string(),
            ],
        )?;
        Ok(())
    }
}
