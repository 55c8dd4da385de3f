use std::fmt;

/// A single problem found in a draft report.
///
/// Item-level errors carry a path such as `columns[3]` or `joins[0]` so a
/// caller can point at the offending entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Report metadata missing (only checked when full metadata is required).
    MissingMetadata { field: &'static str },
    /// A section or item does not have the expected shape.
    Malformed { path: String, expected: &'static str },
    /// A required key is absent or empty.
    MissingValue { path: String, key: &'static str },
    /// A key holds a value outside its allowed set.
    InvalidValue {
        path: String,
        key: &'static str,
        value: String,
    },
    /// Reference to a data source the registry does not know.
    UnknownSource { path: String, source: String },
    /// Reference to a field the registry does not know.
    UnknownField { path: String, field: String },
    /// Field exists but its source is not part of the report.
    OutOfScope { path: String, field: String },
    /// Field exists but may not be used this way.
    NotPermitted {
        path: String,
        field: String,
        capability: &'static str,
    },
    /// A section holds more entries than the configured limit.
    TooMany {
        section: &'static str,
        count: usize,
        max: usize,
    },
    NoColumns,
    InvalidJoinCondition { path: String },
    DuplicateJoin { path: String, table: String },
    DuplicateAlias { path: String, alias: String },
    DuplicateFilter { path: String, field: String },
    GroupByWithoutAggregations,
    /// Derived column expression problem.
    InvalidExpression { path: String, message: String },
}

impl ConfigError {
    /// Item path (`columns[3]`), when the error concerns one entry.
    pub fn path(&self) -> Option<&str> {
        match self {
            ConfigError::Malformed { path, .. }
            | ConfigError::MissingValue { path, .. }
            | ConfigError::InvalidValue { path, .. }
            | ConfigError::UnknownSource { path, .. }
            | ConfigError::UnknownField { path, .. }
            | ConfigError::OutOfScope { path, .. }
            | ConfigError::NotPermitted { path, .. }
            | ConfigError::InvalidJoinCondition { path }
            | ConfigError::DuplicateJoin { path, .. }
            | ConfigError::DuplicateAlias { path, .. }
            | ConfigError::DuplicateFilter { path, .. }
            | ConfigError::InvalidExpression { path, .. } => Some(path),
            ConfigError::MissingMetadata { .. }
            | ConfigError::TooMany { .. }
            | ConfigError::NoColumns
            | ConfigError::GroupByWithoutAggregations => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingMetadata { field } => write!(f, "{} is required", field),
            ConfigError::Malformed { path, expected } => {
                write!(f, "{}: expected {}", path, expected)
            }
            ConfigError::MissingValue { path, key } => write!(f, "{}: '{}' is required", path, key),
            ConfigError::InvalidValue { path, key, value } => {
                write!(f, "{}: invalid {} '{}'", path, key, value)
            }
            ConfigError::UnknownSource { path, source } => {
                write!(f, "{}: unknown data source '{}'", path, source)
            }
            ConfigError::UnknownField { path, field } => {
                write!(f, "{}: unknown field '{}'", path, field)
            }
            ConfigError::OutOfScope { path, field } => write!(
                f,
                "{}: field '{}' does not belong to a selected data source",
                path, field
            ),
            ConfigError::NotPermitted {
                path,
                field,
                capability,
            } => write!(f, "{}: field '{}' is not {}", path, field, capability),
            ConfigError::TooMany {
                section,
                count,
                max,
            } => write!(
                f,
                "{}: {} entries exceed the limit of {}",
                section, count, max
            ),
            ConfigError::NoColumns => write!(f, "columns: at least one column is required"),
            ConfigError::InvalidJoinCondition { path } => write!(
                f,
                "{}: join condition must name exactly two fields",
                path
            ),
            ConfigError::DuplicateJoin { path, table } => {
                write!(f, "{}: '{}' is already part of the report", path, table)
            }
            ConfigError::DuplicateAlias { path, alias } => {
                write!(f, "{}: alias '{}' is already used", path, alias)
            }
            ConfigError::DuplicateFilter { path, field } => {
                write!(f, "{}: a filter on '{}' is already declared", path, field)
            }
            ConfigError::GroupByWithoutAggregations => write!(
                f,
                "aggregations: group_by requires at least one aggregation function"
            ),
            ConfigError::InvalidExpression { path, message } => write!(f, "{}: {}", path, message),
        }
    }
}

impl std::error::Error for ConfigError {}
