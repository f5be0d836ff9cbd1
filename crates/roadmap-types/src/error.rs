//! Error types for row decoding.

use thiserror::Error;

use crate::table::Table;

/// Errors from turning untyped rows into typed entities.
#[derive(Error, Debug)]
pub enum TypesError {
    /// A required column is absent from the row.
    #[error("{table}: missing field {field}")]
    MissingField { table: Table, field: &'static str },

    /// The row did not match the entity's shape.
    #[error("{table}: decode failed: {message}")]
    Decode { table: Table, message: String },
}
