use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A report as submitted by a user, before validation.
///
/// The structural sections stay as raw JSON so that the validator can
/// report every problem with its position instead of failing on the first
/// deserialization error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    /// `{"primary": "...", "joins": [...]}`
    pub data_sources: Value,
    /// `[{"field": "...", "label": "...", ...}]`
    pub columns: Value,
    /// `[{"field": "...", "label": "...", "type": "...", ...}]`
    pub filters: Value,
    /// `{"group_by": [...], "functions": [...]}`
    pub aggregations: Value,
    /// `[{"field": "...", "direction": "asc"}]`
    pub sorting: Value,
    pub is_shared: bool,
    pub is_favorite: bool,
}

impl DraftConfig {
    /// Parse a draft from JSON text.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
