use std::collections::HashSet;

use async_trait::async_trait;
use common::EntityKey;
use serde::de::DeserializeOwned;

use crate::{ConcurrencyToken, Result, StoreError};

/// A stored row: the serialized entity plus the columns the store manages.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: EntityKey,

    /// Key of the row this one belongs to, for child collections.
    pub parent: Option<EntityKey>,

    pub token: ConcurrencyToken,

    pub body: serde_json::Value,
}

impl Row {
    /// Deserializes the row body into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Row selection pushed down to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Keys(Vec<EntityKey>),
    Parents(Vec<EntityKey>),
}

impl RowFilter {
    /// Returns true if the filter selects this row.
    pub fn selects(&self, key: EntityKey, parent: Option<EntityKey>) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Keys(keys) => keys.contains(&key),
            RowFilter::Parents(parents) => parent.is_some_and(|p| parents.contains(&p)),
        }
    }
}

/// A child row written as part of its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub key: EntityKey,
    pub body: serde_json::Value,
}

/// One write applied inside a store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        table: &'static str,
        key: EntityKey,
        parent: Option<EntityKey>,
        body: serde_json::Value,
    },
    /// Replaces the row only if its token still equals `expected`.
    Update {
        table: &'static str,
        key: EntityKey,
        parent: Option<EntityKey>,
        expected: ConcurrencyToken,
        body: serde_json::Value,
    },
    /// Deletes the row only if its token still equals `expected`.
    Delete {
        table: &'static str,
        key: EntityKey,
        expected: ConcurrencyToken,
    },
    /// Makes the stored children of `parent` exactly `rows`: missing rows are
    /// deleted, new rows inserted, existing rows overwritten.
    ReplaceChildren {
        table: &'static str,
        parent: EntityKey,
        rows: Vec<ChildRow>,
    },
    DeleteChildren {
        table: &'static str,
        parent: EntityKey,
    },
}

impl WriteOp {
    pub(crate) fn root_target(&self) -> Option<(&'static str, EntityKey)> {
        match self {
            WriteOp::Insert { table, key, .. }
            | WriteOp::Update { table, key, .. }
            | WriteOp::Delete { table, key, .. } => Some((*table, *key)),
            WriteOp::ReplaceChildren { .. } | WriteOp::DeleteChildren { .. } => None,
        }
    }
}

/// Backing store for units of work.
///
/// Implementations must make every write of one transaction visible
/// atomically, and must check concurrency tokens atomically with the write.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Transaction: StoreTransaction;

    /// Reads rows of a table outside of any transaction, ordered by key.
    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>>;

    /// Reserves fresh keys. Keys are never reused, even if the writes that
    /// would have used them are rolled back.
    async fn next_keys(&self, count: usize) -> Result<Vec<EntityKey>>;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Self::Transaction>;
}

/// An open store transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTransaction: Send + 'static {
    /// Reads rows of a table, seeing this transaction's own writes.
    async fn fetch(&mut self, table: &str, filter: &RowFilter) -> Result<Vec<Row>>;

    /// Applies one write. Returns the new token of the written root row, if any.
    async fn apply(&mut self, op: &WriteOp) -> Result<Option<ConcurrencyToken>>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Validates a batch of writes before it reaches the store.
pub fn validate_batch(ops: &[WriteOp]) -> Result<()> {
    let mut seen = HashSet::new();
    for op in ops {
        if let Some((table, key)) = op.root_target() {
            if key == 0 {
                return Err(StoreError::InvalidBatch(format!(
                    "{table} row staged without a key"
                )));
            }
            if !seen.insert((table, key)) {
                return Err(StoreError::InvalidBatch(format!(
                    "{table} {key} staged more than once"
                )));
            }
        }
        if let WriteOp::ReplaceChildren { table, rows, .. } = op
            && rows.iter().any(|row| row.key == 0)
        {
            return Err(StoreError::InvalidBatch(format!(
                "{table} child row staged without a key"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(key: EntityKey) -> WriteOp {
        WriteOp::Insert {
            table: "things",
            key,
            parent: None,
            body: serde_json::json!({}),
        }
    }

    #[test]
    fn filter_selects_by_key_and_parent() {
        assert!(RowFilter::All.selects(1, None));
        assert!(RowFilter::Keys(vec![1, 2]).selects(2, None));
        assert!(!RowFilter::Keys(vec![1, 2]).selects(3, None));
        assert!(RowFilter::Parents(vec![9]).selects(3, Some(9)));
        assert!(!RowFilter::Parents(vec![9]).selects(3, None));
    }

    #[test]
    fn batch_rejects_duplicate_root_writes() {
        let result = validate_batch(&[
            insert(1),
            WriteOp::Delete {
                table: "things",
                key: 1,
                expected: ConcurrencyToken::first(),
            },
        ]);
        assert!(matches!(result, Err(StoreError::InvalidBatch(_))));
    }

    #[test]
    fn batch_rejects_unkeyed_rows() {
        assert!(validate_batch(&[insert(0)]).is_err());

        let children = WriteOp::ReplaceChildren {
            table: "parts",
            parent: 1,
            rows: vec![ChildRow {
                key: 0,
                body: serde_json::json!({}),
            }],
        };
        assert!(validate_batch(&[children]).is_err());
    }

    #[test]
    fn batch_accepts_distinct_writes() {
        assert!(validate_batch(&[insert(1), insert(2)]).is_ok());
    }

    #[test]
    fn row_decodes_body() {
        let row = Row {
            key: 1,
            parent: None,
            token: ConcurrencyToken::first(),
            body: serde_json::json!({"name": "widget"}),
        };
        let value: serde_json::Value = row.decode().unwrap();
        assert_eq!(value["name"], "widget");
    }
}
