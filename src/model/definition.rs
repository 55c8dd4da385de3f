use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::layout::ReportLayout;
use super::{ReportId, TenantId, UserId};
use super::hash::compute_hash;

/// A persisted, tenant-owned report definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDefinition {
    pub id: ReportId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub layout: ReportLayout,
    pub is_shared: bool,
    pub is_favorite: bool,
    /// Default report of its category within the tenant.
    pub is_default: bool,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    /// At least one active schedule exists.
    pub is_scheduled: bool,
    /// Bumped only when the layout hash changes.
    pub version: i64,
    /// SHA-256 of the serialized layout.
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportDefinition {
    /// An unsaved definition (id 0) wrapping `layout`.
    pub fn new(
        tenant_id: TenantId,
        user_id: UserId,
        name: impl Into<String>,
        layout: ReportLayout,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id,
            user_id,
            name: name.into(),
            description: None,
            category: None,
            config_hash: layout_hash(&layout),
            layout,
            is_shared: false,
            is_favorite: false,
            is_default: false,
            execution_count: 0,
            last_executed_at: None,
            is_scheduled: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Content hash of a layout, used to decide version bumps.
pub fn layout_hash(layout: &ReportLayout) -> String {
    // Layouts only hold strings, numbers and JSON scalars; serialization cannot fail.
    compute_hash(layout).unwrap_or_default()
}
