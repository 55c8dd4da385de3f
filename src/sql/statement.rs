//! Rendered statement: SQL text plus the values bound to its placeholders.

use super::expr::Literal;

/// SQL text with its bound parameters, in placeholder order.
///
/// The text never contains a user-supplied value; every such value sits in
/// `params` and reaches the database through the driver's binding API.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Literal>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Number of bound parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql)
    }
}
