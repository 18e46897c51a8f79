use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Storage(#[from] RusqliteError), // Converts rusqlite::Error automatically

    /// The active user is not allowed to make the requested change.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Declared columns do not match the columns of the existing table.
    #[error("Schema mismatch for table '{table_id}': {reason}")]
    SchemaMismatch { table_id: String, reason: String },

    #[error("Row '{0}' already exists")]
    DuplicateRow(String),

    #[error("Row '{0}' not found")]
    RowNotFound(String),

    #[error("Row '{0}' has checkpoints")]
    RowHasCheckpoints(String),

    #[error("Row '{0}' is in conflict")]
    RowInConflict(String),

    /// A key/value store value failed structural validation.
    #[error("Invalid value shape: {0}")]
    InvalidValueShape(String),

    /// On-disk state violates a store invariant. Never auto-repaired.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Error: {0}")]
    Invalid(String), // Allows custom application errors
}
