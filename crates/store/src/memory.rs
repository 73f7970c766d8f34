use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use common::EntityKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::{Row, RowFilter, Store, StoreTransaction, WriteOp};
use crate::{ConcurrencyToken, Result, StoreError};

#[derive(Debug, Clone)]
struct StoredRow {
    parent: Option<EntityKey>,
    token: ConcurrencyToken,
    body: serde_json::Value,
}

type Tables = HashMap<String, BTreeMap<EntityKey, StoredRow>>;

/// In-memory store for testing.
///
/// Provides the same interface and guarantees as the PostgreSQL store.
/// Transactions are serialized: an open transaction holds the store's lock
/// until it is committed, rolled back or dropped.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    keys: Arc<AtomicI64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            tables: Arc::default(),
            keys: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows stored in a table.
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, BTreeMap::len)
    }

    /// Clears all tables. Key allocation keeps counting.
    pub async fn clear(&self) {
        self.tables.lock().await.clear();
    }
}

fn select(tables: &Tables, table: &str, filter: &RowFilter) -> Vec<Row> {
    tables
        .get(table)
        .map(|rows| {
            rows.iter()
                .filter(|(key, row)| filter.selects(**key, row.parent))
                .map(|(key, row)| Row {
                    key: *key,
                    parent: row.parent,
                    token: row.token,
                    body: row.body.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn conflict(
    table: &str,
    key: EntityKey,
    expected: ConcurrencyToken,
    actual: Option<ConcurrencyToken>,
) -> StoreError {
    StoreError::ConcurrencyConflict {
        table: table.to_string(),
        key,
        expected,
        actual,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        Ok(select(&*self.tables.lock().await, table, filter))
    }

    async fn next_keys(&self, count: usize) -> Result<Vec<EntityKey>> {
        let first = self.keys.fetch_add(count as i64, Ordering::SeqCst);
        Ok((first..first + count as i64).collect())
    }

    async fn begin(&self) -> Result<Self::Transaction> {
        let guard = self.tables.clone().lock_owned().await;
        let backup = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            backup: Some(backup),
        })
    }
}

/// Transaction over an [`InMemoryStore`]. Writes go straight to the tables;
/// a snapshot taken at `begin` is restored unless the transaction commits.
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    backup: Option<Tables>,
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            *self.guard = backup;
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn fetch(&mut self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        Ok(select(&self.guard, table, filter))
    }

    async fn apply(&mut self, op: &WriteOp) -> Result<Option<ConcurrencyToken>> {
        match op {
            WriteOp::Insert {
                table,
                key,
                parent,
                body,
            } => {
                let rows = self.guard.entry(table.to_string()).or_default();
                if let Some(existing) = rows.get(key) {
                    return Err(conflict(
                        table,
                        *key,
                        ConcurrencyToken::initial(),
                        Some(existing.token),
                    ));
                }
                let token = ConcurrencyToken::first();
                rows.insert(
                    *key,
                    StoredRow {
                        parent: *parent,
                        token,
                        body: body.clone(),
                    },
                );
                Ok(Some(token))
            }
            WriteOp::Update {
                table,
                key,
                parent,
                expected,
                body,
            } => {
                let row = self
                    .guard
                    .get_mut(*table)
                    .and_then(|rows| rows.get_mut(key))
                    .ok_or_else(|| conflict(table, *key, *expected, None))?;
                if row.token != *expected {
                    return Err(conflict(table, *key, *expected, Some(row.token)));
                }
                row.token = row.token.next();
                row.parent = *parent;
                row.body = body.clone();
                Ok(Some(row.token))
            }
            WriteOp::Delete {
                table,
                key,
                expected,
            } => {
                let rows = self
                    .guard
                    .get_mut(*table)
                    .ok_or_else(|| conflict(table, *key, *expected, None))?;
                let actual = rows.get(key).map(|row| row.token);
                if actual != Some(*expected) {
                    return Err(conflict(table, *key, *expected, actual));
                }
                rows.remove(key);
                Ok(None)
            }
            WriteOp::ReplaceChildren {
                table,
                parent,
                rows: children,
            } => {
                let rows = self.guard.entry(table.to_string()).or_default();
                rows.retain(|key, row| {
                    row.parent != Some(*parent) || children.iter().any(|c| c.key == *key)
                });
                for child in children {
                    match rows.get_mut(&child.key) {
                        Some(row) => {
                            row.token = row.token.next();
                            row.parent = Some(*parent);
                            row.body = child.body.clone();
                        }
                        None => {
                            rows.insert(
                                child.key,
                                StoredRow {
                                    parent: Some(*parent),
                                    token: ConcurrencyToken::first(),
                                    body: child.body.clone(),
                                },
                            );
                        }
                    }
                }
                Ok(None)
            }
            WriteOp::DeleteChildren { table, parent } => {
                if let Some(rows) = self.guard.get_mut(*table) {
                    rows.retain(|_, row| row.parent != Some(*parent));
                }
                Ok(None)
            }
        }
    }

    async fn commit(mut self) -> Result<()> {
        self.backup = None;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        // Dropping restores the snapshot.
        Ok(())
    }
}
