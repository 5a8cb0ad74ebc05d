//! User-visible constraint violations.
//!
//! These are the only recoverable errors the mutation API surfaces. The
//! table fully reverts any partial side effects (index inserts, allocated
//! slot, export appends) before returning one. Everything else, such as a
//! missing index entry or a failed undo replay, is corruption and panics
//! with diagnostic context.

use std::fmt;

/// A user-initiated mutation violated a declared constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// A non-nullable column holds NULL.
    NotNull {
        /// Table the mutation targeted.
        table: String,
        /// Violating column.
        column: String,
    },
    /// A unique index would hold two entries for one key.
    Unique {
        /// Table the mutation targeted.
        table: String,
        /// Violating index.
        index: String,
    },
}

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintError::NotNull { table, column } => {
                write!(
                    f,
                    "null value in column \"{}\" of table \"{}\" violates not-null constraint",
                    column, table
                )
            }
            ConstraintError::Unique { table, index } => {
                write!(
                    f,
                    "duplicate key in table \"{}\" violates unique constraint \"{}\"",
                    table, index
                )
            }
        }
    }
}

impl std::error::Error for ConstraintError {}
