use common::EntityKey;
use thiserror::Error;

use crate::ConcurrencyToken;

/// Errors that can occur when reading from or writing to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write carried a concurrency token that no longer matches the stored
    /// row, or the row disappeared underneath it.
    #[error(
        "Concurrency conflict on {table} {key}: expected token {expected}, found {}",
        describe_actual(.actual)
    )]
    ConcurrencyConflict {
        table: String,
        key: EntityKey,
        expected: ConcurrencyToken,
        actual: Option<ConcurrencyToken>,
    },

    /// The entity was not loaded with tracking in this unit of work, so it
    /// cannot be staged for update or removal.
    #[error("Entity {table} {key} is not tracked by this unit of work")]
    Untracked { table: String, key: EntityKey },

    /// An include step was used without the step it depends on.
    #[error("Invalid include: {0}")]
    InvalidInclude(String),

    /// A batch of writes failed validation before reaching the store.
    #[error("Invalid write batch: {0}")]
    InvalidBatch(String),

    /// `begin_transaction` was called while a transaction is already open.
    #[error("A transaction is already active on this unit of work")]
    TransactionAlreadyActive,

    /// Commit or rollback was requested without an open transaction.
    #[error("No active transaction on this unit of work")]
    NoActiveTransaction,

    /// Commit was requested while changes were staged but not saved.
    #[error("Cannot commit with {staged} unsaved staged change(s)")]
    UnsavedChanges { staged: usize },

    /// The operation was cancelled before the store responded.
    #[error("Operation cancelled")]
    Cancelled,

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for stale-write failures the caller may resolve by reloading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

fn describe_actual(actual: &Option<ConcurrencyToken>) -> String {
    actual.map_or_else(|| "no row".to_string(), |t| t.to_string())
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
