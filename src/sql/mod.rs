//! SQL generation module.
//!
//! This module provides a type-safe SQL builder that generates multi-dialect SQL
//! with bound parameters. It includes:
//!
//! - [`query`] - SELECT query builder
//! - [`expr`] - Expression AST and builder DSL
//! - [`token`] - Token types for SQL generation
//! - [`statement`] - SQL text plus bound values
//! - [`dialect`] - SQL dialect implementations

pub mod dialect;
pub mod expr;
pub mod query;
pub mod statement;
pub mod token;

// Re-export commonly used types at the sql module level
pub use dialect::{Dialect, SqlDialect};
pub use expr::{
    avg, coalesce, col, conjunction, count, count_star, func, lit_bool, lit_float, lit_int,
    lit_str, lower, max, min, param, star, sum, table_col, BinaryOperator, Expr, ExprExt,
    Literal, SortDir,
};
pub use query::{Join, JoinType, OrderByExpr, Query, SelectExpr, TableRef};
pub use statement::Statement;
pub use token::{Token, TokenStream};
