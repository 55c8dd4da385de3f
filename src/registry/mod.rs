//! Data source registry - the closed catalog reports may query.
//!
//! Only sources, fields and relations listed here are reachable from a
//! report definition. The registry is read-only once loaded and is shared
//! between the validator, compiler and advisor behind an `Arc`.
//!
//! Catalogs are TOML:
//!
//! ```toml
//! [sources.invoices]
//! label = "Invoices"
//! category = "finance"
//! table = "invoices"
//! model = "Invoice"
//!
//! [sources.invoices.fields.status]
//! label = "Status"
//! type = "text"
//! filterable = true
//!
//! [sources.invoices.relations.customer]
//! target = "customers"
//! cardinality = "many_to_one"
//! local_field = "customer_id"
//! foreign_field = "id"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Tenant column assumed when a source does not name one.
pub const DEFAULT_TENANT_COLUMN: &str = "organization_id";

const BUILTIN_CATALOG: &str = include_str!("default_catalog.toml");

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Whether `name` is a plain SQL identifier (letters, digits, underscore).
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{kind} '{name}' is not a plain SQL identifier")]
    InvalidIdentifier { kind: &'static str, name: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// Metadata types
// ============================================================================

/// Data type of a catalog field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Boolean,
}

impl FieldType {
    /// Date-like types accept `YYYY-MM-DD` filter values.
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

/// Cardinality hint of a relation. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    #[default]
    ManyToOne,
    ManyToMany,
}

/// A reportable field of a data source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldMetadata {
    pub key: String,
    pub label: String,
    pub data_type: FieldType,
    pub filterable: bool,
    pub sortable: bool,
    pub aggregatable: bool,
    /// Physical column, when it differs from `key`.
    pub column: Option<String>,
}

impl FieldMetadata {
    /// Physical column name.
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.key)
    }
}

/// A navigable relation from one source to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationMetadata {
    pub key: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub local_field: Option<String>,
    pub foreign_field: Option<String>,
}

/// A registry entry: one queryable business entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSource {
    pub key: String,
    pub label: String,
    pub category: String,
    /// Backing table.
    pub table: String,
    /// Backing model identifier.
    pub model: String,
    /// Column holding the owning tenant id.
    pub tenant_column: String,
    pub fields: BTreeMap<String, FieldMetadata>,
    pub relations: BTreeMap<String, RelationMetadata>,
}

impl DataSource {
    pub fn field(&self, key: &str) -> Option<&FieldMetadata> {
        self.fields.get(key)
    }

    /// Structurally usable: has fields and non-empty table/model/tenant identifiers.
    pub fn is_valid(&self) -> bool {
        !self.fields.is_empty()
            && !self.table.is_empty()
            && !self.model.is_empty()
            && !self.tenant_column.is_empty()
    }
}

// ============================================================================
// Catalog file format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    sources: BTreeMap<String, SourceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    label: Option<String>,
    #[serde(default)]
    category: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    model: String,
    tenant_column: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, FieldEntry>,
    #[serde(default)]
    relations: BTreeMap<String, RelationEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldEntry {
    label: Option<String>,
    #[serde(rename = "type")]
    data_type: FieldType,
    #[serde(default)]
    filterable: bool,
    #[serde(default)]
    sortable: bool,
    #[serde(default)]
    aggregatable: bool,
    column: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelationEntry {
    target: String,
    #[serde(default)]
    cardinality: Cardinality,
    local_field: Option<String>,
    foreign_field: Option<String>,
}

fn check_identifier(kind: &'static str, name: &str) -> RegistryResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier {
            kind,
            name: name.to_string(),
        })
    }
}

impl SourceEntry {
    fn into_source(self, key: String) -> RegistryResult<DataSource> {
        check_identifier("Source", &key)?;
        // Empty table/model are allowed to load; such a source just never validates.
        if !self.table.is_empty() {
            check_identifier("Table", &self.table)?;
        }
        let tenant_column = self
            .tenant_column
            .unwrap_or_else(|| DEFAULT_TENANT_COLUMN.to_string());
        if !tenant_column.is_empty() {
            check_identifier("Tenant column", &tenant_column)?;
        }

        let mut fields = BTreeMap::new();
        for (field_key, entry) in self.fields {
            check_identifier("Field", &field_key)?;
            if let Some(column) = &entry.column {
                check_identifier("Column", column)?;
            }
            fields.insert(
                field_key.clone(),
                FieldMetadata {
                    label: entry.label.unwrap_or_else(|| field_key.clone()),
                    key: field_key,
                    data_type: entry.data_type,
                    filterable: entry.filterable,
                    sortable: entry.sortable,
                    aggregatable: entry.aggregatable,
                    column: entry.column,
                },
            );
        }

        let mut relations = BTreeMap::new();
        for (relation_key, entry) in self.relations {
            check_identifier("Relation", &relation_key)?;
            relations.insert(
                relation_key.clone(),
                RelationMetadata {
                    key: relation_key,
                    target: entry.target,
                    cardinality: entry.cardinality,
                    local_field: entry.local_field,
                    foreign_field: entry.foreign_field,
                },
            );
        }

        Ok(DataSource {
            label: self.label.unwrap_or_else(|| key.clone()),
            key,
            category: self.category,
            table: self.table,
            model: self.model,
            tenant_column,
            fields,
            relations,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The catalog of data sources available to reports.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sources: BTreeMap<String, DataSource>,
}

impl Registry {
    /// Build a registry from already-constructed sources.
    pub fn new(sources: impl IntoIterator<Item = DataSource>) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.key.clone(), s)).collect(),
        }
    }

    /// Parse a TOML catalog.
    pub fn from_toml_str(content: &str) -> RegistryResult<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let mut sources = BTreeMap::new();
        for (key, entry) in file.sources {
            sources.insert(key.clone(), entry.into_source(key)?);
        }
        Ok(Self { sources })
    }

    /// Load a TOML catalog from disk.
    pub fn from_file(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// The built-in business catalog.
    pub fn builtin() -> RegistryResult<Self> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Look up a source by key.
    pub fn get(&self, source: &str) -> Option<&DataSource> {
        self.sources.get(source)
    }

    /// Field metadata map of a source.
    pub fn fields(&self, source: &str) -> Option<&BTreeMap<String, FieldMetadata>> {
        self.get(source).map(|s| &s.fields)
    }

    /// Relation metadata map of a source.
    pub fn relations(&self, source: &str) -> Option<&BTreeMap<String, RelationMetadata>> {
        self.get(source).map(|s| &s.relations)
    }

    /// A single field of a source.
    pub fn field(&self, source: &str, field: &str) -> Option<&FieldMetadata> {
        self.get(source).and_then(|s| s.field(field))
    }

    /// Resolve a `source.field` full name.
    pub fn resolve_field(&self, full_name: &str) -> Option<(&DataSource, &FieldMetadata)> {
        let (source, field) = full_name.split_once('.')?;
        let ds = self.get(source)?;
        let meta = ds.field(field)?;
        Some((ds, meta))
    }

    pub fn is_valid_source(&self, source: &str) -> bool {
        self.get(source).is_some_and(DataSource::is_valid)
    }

    /// Both ends exist and validate, and any declared join fields exist.
    pub fn is_valid_relation(&self, source: &str, relation: &str) -> bool {
        let Some(rel) = self.relations(source).and_then(|r| r.get(relation)) else {
            return false;
        };
        if !self.is_valid_source(source) || !self.is_valid_source(&rel.target) {
            return false;
        }
        let local_ok = rel
            .local_field
            .as_deref()
            .is_none_or(|f| self.field(source, f).is_some());
        let foreign_ok = rel
            .foreign_field
            .as_deref()
            .is_none_or(|f| self.field(&rel.target, f).is_some());
        local_ok && foreign_ok
    }

    pub fn is_filterable(&self, source: &str, field: &str) -> bool {
        self.field(source, field).is_some_and(|f| f.filterable)
    }

    pub fn is_sortable(&self, source: &str, field: &str) -> bool {
        self.field(source, field).is_some_and(|f| f.sortable)
    }

    pub fn is_aggregatable(&self, source: &str, field: &str) -> bool {
        self.field(source, field).is_some_and(|f| f.aggregatable)
    }

    /// Source keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// All sources in key order.
    pub fn sources(&self) -> impl Iterator<Item = &DataSource> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
