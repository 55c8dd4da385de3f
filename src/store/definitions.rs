//! Report definition rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{json_col, opt_ts, opt_ts_col, ts, ts_col, ReportStore, StoreError, StoreResult};
use crate::model::{layout_hash, ReportDefinition, ReportId, TenantId, UserId};

const COLUMNS: &str = "id, tenant_id, user_id, name, description, category, layout, \
     is_shared, is_favorite, is_default, execution_count, last_executed_at, is_scheduled, \
     version, config_hash, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ReportDefinition> {
    Ok(ReportDefinition {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        user_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        category: row.get(5)?,
        layout: json_col(row, 6)?,
        is_shared: row.get(7)?,
        is_favorite: row.get(8)?,
        is_default: row.get(9)?,
        execution_count: row.get(10)?,
        last_executed_at: opt_ts_col(row, 11)?,
        is_scheduled: row.get(12)?,
        version: row.get(13)?,
        config_hash: row.get(14)?,
        created_at: ts_col(row, 15)?,
        updated_at: ts_col(row, 16)?,
    })
}

fn not_found(id: ReportId) -> StoreError {
    StoreError::NotFound {
        kind: "report",
        id: id.to_string(),
    }
}

fn fetch(conn: &Connection, tenant_id: TenantId, id: ReportId) -> StoreResult<Option<ReportDefinition>> {
    let sql = format!(
        "SELECT {} FROM report_definitions WHERE tenant_id = ? AND id = ?",
        COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![tenant_id, id], from_row)
        .optional()?)
}

impl ReportStore {
    /// Persist a new definition and return it with its assigned id.
    pub fn insert_definition(&self, definition: &ReportDefinition) -> StoreResult<ReportDefinition> {
        let conn = self.conn()?;
        let layout = serde_json::to_string(&definition.layout)?;
        let hash = layout_hash(&definition.layout);

        conn.execute(
            "INSERT INTO report_definitions (
                tenant_id, user_id, name, description, category, layout,
                is_shared, is_favorite, is_default, execution_count, last_executed_at,
                is_scheduled, version, config_hash, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                definition.tenant_id,
                definition.user_id,
                definition.name,
                definition.description,
                definition.category,
                layout,
                definition.is_shared,
                definition.is_favorite,
                definition.is_default,
                definition.execution_count,
                opt_ts(definition.last_executed_at),
                definition.is_scheduled,
                definition.version,
                hash,
                ts(definition.created_at),
                ts(definition.updated_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(tenant_id = definition.tenant_id, report_id = id, "report definition saved");

        fetch(&conn, definition.tenant_id, id)?.ok_or_else(|| not_found(id))
    }

    pub fn get_definition(
        &self,
        tenant_id: TenantId,
        id: ReportId,
    ) -> StoreResult<Option<ReportDefinition>> {
        let conn = self.conn()?;
        fetch(&conn, tenant_id, id)
    }

    /// Definitions `user_id` may see: their own plus shared ones.
    pub fn list_definitions(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> StoreResult<Vec<ReportDefinition>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM report_definitions
             WHERE tenant_id = ? AND (user_id = ? OR is_shared = 1)
             ORDER BY name, id",
            COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let definitions = stmt
            .query_map(params![tenant_id, user_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(definitions)
    }

    /// Write back editable fields. The version is bumped only when the
    /// layout hash changed.
    pub fn update_definition(&self, definition: &ReportDefinition) -> StoreResult<ReportDefinition> {
        let conn = self.conn()?;
        let current = fetch(&conn, definition.tenant_id, definition.id)?
            .ok_or_else(|| not_found(definition.id))?;

        let hash = layout_hash(&definition.layout);
        let version = if hash == current.config_hash {
            current.version
        } else {
            current.version + 1
        };

        conn.execute(
            "UPDATE report_definitions SET
                name = ?, description = ?, category = ?, layout = ?,
                is_shared = ?, is_favorite = ?, version = ?, config_hash = ?, updated_at = ?
             WHERE tenant_id = ? AND id = ?",
            params![
                definition.name,
                definition.description,
                definition.category,
                serde_json::to_string(&definition.layout)?,
                definition.is_shared,
                definition.is_favorite,
                version,
                hash,
                ts(Utc::now()),
                definition.tenant_id,
                definition.id,
            ],
        )?;

        fetch(&conn, definition.tenant_id, definition.id)?.ok_or_else(|| not_found(definition.id))
    }

    /// Delete a definition and its schedules. Execution history stays.
    pub fn delete_definition(&self, tenant_id: TenantId, id: ReportId) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM report_schedules WHERE tenant_id = ? AND report_id = ?",
            params![tenant_id, id],
        )?;
        let rows = tx.execute(
            "DELETE FROM report_definitions WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    /// Make `id` the only default report of its category within the tenant.
    pub fn set_default(&self, tenant_id: TenantId, id: ReportId) -> StoreResult<ReportDefinition> {
        let mut conn = self.conn()?;
        let current = fetch(&conn, tenant_id, id)?.ok_or_else(|| not_found(id))?;

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE report_definitions SET is_default = 0
             WHERE tenant_id = ? AND category IS ? AND id <> ?",
            params![tenant_id, current.category, id],
        )?;
        tx.execute(
            "UPDATE report_definitions SET is_default = 1 WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        tx.commit()?;

        fetch(&conn, tenant_id, id)?.ok_or_else(|| not_found(id))
    }

    /// Flip the favorite flag; returns the new value.
    pub fn toggle_favorite(&self, tenant_id: TenantId, id: ReportId) -> StoreResult<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_definitions SET is_favorite = 1 - is_favorite
             WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        if rows == 0 {
            return Err(not_found(id));
        }
        let favorite: bool = conn.query_row(
            "SELECT is_favorite FROM report_definitions WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
            |row| row.get(0),
        )?;
        Ok(favorite)
    }

    /// Count one run attempt.
    pub fn record_execution_attempt(
        &self,
        tenant_id: TenantId,
        id: ReportId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "UPDATE report_definitions
             SET execution_count = execution_count + 1, last_executed_at = ?
             WHERE tenant_id = ? AND id = ?",
            params![ts(at), tenant_id, id],
        )?;
        if rows == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Recompute the scheduling flag from the report's active schedules.
    pub fn refresh_scheduled_flag(&self, tenant_id: TenantId, id: ReportId) -> StoreResult<bool> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE report_definitions SET is_scheduled = EXISTS (
                SELECT 1 FROM report_schedules
                WHERE report_schedules.tenant_id = report_definitions.tenant_id
                  AND report_schedules.report_id = report_definitions.id
                  AND report_schedules.active = 1
             )
             WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        let scheduled: Option<bool> = conn
            .query_row(
                "SELECT is_scheduled FROM report_definitions WHERE tenant_id = ? AND id = ?",
                params![tenant_id, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(scheduled.unwrap_or(false))
    }
}
