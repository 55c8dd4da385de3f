//! Report schedule rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::{
    enum_col, json_col, opt_ts_col, opt_uuid_col, ts, ts_col, ReportStore, StoreError,
    StoreResult,
};
use crate::model::{ExportFormat, ReportId, ReportSchedule, ScheduleId, TenantId};

const COLUMNS: &str = "id, report_id, tenant_id, user_id, recurrence, filter_preset, \
     recipients, export_format, active, next_run_at, last_run_at, last_execution_id, \
     created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ReportSchedule> {
    Ok(ReportSchedule {
        id: row.get(0)?,
        report_id: row.get(1)?,
        tenant_id: row.get(2)?,
        user_id: row.get(3)?,
        recurrence: json_col(row, 4)?,
        filter_preset: json_col(row, 5)?,
        recipients: json_col(row, 6)?,
        export_format: enum_col(row, 7, "export format", ExportFormat::parse)?,
        active: row.get(8)?,
        next_run_at: ts_col(row, 9)?,
        last_run_at: opt_ts_col(row, 10)?,
        last_execution_id: opt_uuid_col(row, 11)?,
        created_at: ts_col(row, 12)?,
        updated_at: ts_col(row, 13)?,
    })
}

fn not_found(id: ScheduleId) -> StoreError {
    StoreError::NotFound {
        kind: "schedule",
        id: id.to_string(),
    }
}

fn fetch(
    conn: &Connection,
    tenant_id: TenantId,
    id: ScheduleId,
) -> StoreResult<Option<ReportSchedule>> {
    let sql = format!(
        "SELECT {} FROM report_schedules WHERE tenant_id = ? AND id = ?",
        COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![tenant_id, id], from_row)
        .optional()?)
}

fn query_all(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<ReportSchedule>> {
    let mut stmt = conn.prepare(sql)?;
    let schedules = stmt
        .query_map(params, from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(schedules)
}

fn insert(conn: &Connection, schedule: &ReportSchedule) -> StoreResult<ScheduleId> {
    conn.execute(
        "INSERT INTO report_schedules (
            report_id, tenant_id, user_id, recurrence, filter_preset, recipients,
            export_format, active, next_run_at, last_run_at, last_execution_id,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            schedule.report_id,
            schedule.tenant_id,
            schedule.user_id,
            serde_json::to_string(&schedule.recurrence)?,
            serde_json::to_string(&schedule.filter_preset)?,
            serde_json::to_string(&schedule.recipients)?,
            schedule.export_format.extension(),
            schedule.active,
            ts(schedule.next_run_at),
            schedule.last_run_at.map(ts),
            schedule.last_execution_id.map(|id| id.to_string()),
            ts(schedule.created_at),
            ts(schedule.updated_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn count_active(conn: &Connection, tenant_id: TenantId) -> StoreResult<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM report_schedules WHERE tenant_id = ? AND active = 1",
        params![tenant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

impl ReportStore {
    /// Persist a new schedule and return it with its assigned id.
    pub fn insert_schedule(&self, schedule: &ReportSchedule) -> StoreResult<ReportSchedule> {
        let conn = self.conn()?;
        let id = insert(&conn, schedule)?;
        fetch(&conn, schedule.tenant_id, id)?.ok_or_else(|| not_found(id))
    }

    /// Persist a new schedule unless its tenant already has `max_active`
    /// active ones. The count and the insert share one transaction; `None`
    /// means the cap was reached.
    pub fn insert_schedule_within_cap(
        &self,
        schedule: &ReportSchedule,
        max_active: usize,
    ) -> StoreResult<Option<ReportSchedule>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if count_active(&tx, schedule.tenant_id)? as usize >= max_active {
            return Ok(None);
        }
        let id = insert(&tx, schedule)?;
        let saved = fetch(&tx, schedule.tenant_id, id)?.ok_or_else(|| not_found(id))?;
        tx.commit()?;
        Ok(Some(saved))
    }

    pub fn get_schedule(
        &self,
        tenant_id: TenantId,
        id: ScheduleId,
    ) -> StoreResult<Option<ReportSchedule>> {
        let conn = self.conn()?;
        fetch(&conn, tenant_id, id)
    }

    /// Schedules of a tenant, optionally narrowed to one report.
    pub fn list_schedules(
        &self,
        tenant_id: TenantId,
        report_id: Option<ReportId>,
    ) -> StoreResult<Vec<ReportSchedule>> {
        let conn = self.conn()?;
        match report_id {
            Some(report_id) => query_all(
                &conn,
                &format!(
                    "SELECT {} FROM report_schedules
                     WHERE tenant_id = ? AND report_id = ? ORDER BY id",
                    COLUMNS
                ),
                params![tenant_id, report_id],
            ),
            None => query_all(
                &conn,
                &format!(
                    "SELECT {} FROM report_schedules WHERE tenant_id = ? ORDER BY id",
                    COLUMNS
                ),
                params![tenant_id],
            ),
        }
    }

    pub fn count_active_schedules(&self, tenant_id: TenantId) -> StoreResult<u32> {
        let conn = self.conn()?;
        count_active(&conn, tenant_id)
    }

    /// Write back recurrence, preset, recipients, format and next run.
    pub fn update_schedule(&self, schedule: &ReportSchedule) -> StoreResult<ReportSchedule> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_schedules SET
                recurrence = ?, filter_preset = ?, recipients = ?, export_format = ?,
                active = ?, next_run_at = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
            params![
                serde_json::to_string(&schedule.recurrence)?,
                serde_json::to_string(&schedule.filter_preset)?,
                serde_json::to_string(&schedule.recipients)?,
                schedule.export_format.extension(),
                schedule.active,
                ts(schedule.next_run_at),
                ts(Utc::now()),
                schedule.tenant_id,
                schedule.id,
            ],
        )?;
        if rows == 0 {
            return Err(not_found(schedule.id));
        }
        fetch(&conn, schedule.tenant_id, schedule.id)?.ok_or_else(|| not_found(schedule.id))
    }

    pub fn set_schedule_active(
        &self,
        tenant_id: TenantId,
        id: ScheduleId,
        active: bool,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_schedules SET active = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
            params![active, ts(Utc::now()), tenant_id, id],
        )?;
        if rows == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    pub fn delete_schedule(&self, tenant_id: TenantId, id: ScheduleId) -> StoreResult<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM report_schedules WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        Ok(rows > 0)
    }

    /// Active schedules whose next run is at or before `now`, across all
    /// tenants, oldest first.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<ReportSchedule>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {} FROM report_schedules
                 WHERE active = 1 AND next_run_at <= ?
                 ORDER BY next_run_at, id",
                COLUMNS
            ),
            params![ts(now)],
        )
    }

    /// Record a run. `next_run_at` is left as is until [`Self::reschedule`].
    pub fn mark_schedule_run(
        &self,
        id: ScheduleId,
        execution_id: Option<Uuid>,
        run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_schedules SET
                last_run_at = ?, last_execution_id = COALESCE(?, last_execution_id),
                updated_at = ?
             WHERE id = ?",
            params![
                ts(run_at),
                execution_id.map(|id| id.to_string()),
                ts(Utc::now()),
                id,
            ],
        )?;
        if rows == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Move the next run without recording a run.
    pub fn reschedule(&self, id: ScheduleId, next_run_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_schedules SET next_run_at = ?, updated_at = ? WHERE id = ?",
            params![ts(next_run_at), ts(Utc::now()), id],
        )?;
        if rows == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Active schedules whose next run was never advanced past their last
    /// run and is already in the past.
    pub fn stale_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<ReportSchedule>> {
        let conn = self.conn()?;
        query_all(
            &conn,
            &format!(
                "SELECT {} FROM report_schedules
                 WHERE active = 1 AND last_run_at IS NOT NULL
                   AND next_run_at <= last_run_at AND next_run_at <= ?
                 ORDER BY id",
                COLUMNS
            ),
            params![ts(now)],
        )
    }
}
