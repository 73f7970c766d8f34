use async_trait::async_trait;
use common::EntityKey;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, Row as _};

use crate::store::{Row, RowFilter, Store, StoreTransaction, WriteOp};
use crate::{ConcurrencyToken, Result, StoreError};

/// PostgreSQL-backed store.
///
/// Every entity row lives in `entity_rows` keyed by `(table_name, key)`;
/// the `version` column is the concurrency token and is bumped by each write.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections` connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode_row(row: PgRow) -> Result<Row> {
    Ok(Row {
        key: row.try_get("key")?,
        parent: row.try_get("parent_key")?,
        token: ConcurrencyToken::new(row.try_get("version")?),
        body: row.try_get("body")?,
    })
}

async fn fetch_rows<'e>(
    executor: impl PgExecutor<'e>,
    table: &str,
    filter: &RowFilter,
) -> Result<Vec<Row>> {
    let rows = match filter {
        RowFilter::All => {
            sqlx::query(
                r#"
                SELECT key, parent_key, version, body
                FROM entity_rows
                WHERE table_name = $1
                ORDER BY key ASC
                "#,
            )
            .bind(table)
            .fetch_all(executor)
            .await?
        }
        RowFilter::Keys(keys) => {
            sqlx::query(
                r#"
                SELECT key, parent_key, version, body
                FROM entity_rows
                WHERE table_name = $1 AND key = ANY($2)
                ORDER BY key ASC
                "#,
            )
            .bind(table)
            .bind(keys)
            .fetch_all(executor)
            .await?
        }
        RowFilter::Parents(parents) => {
            sqlx::query(
                r#"
                SELECT key, parent_key, version, body
                FROM entity_rows
                WHERE table_name = $1 AND parent_key = ANY($2)
                ORDER BY key ASC
                "#,
            )
            .bind(table)
            .bind(parents)
            .fetch_all(executor)
            .await?
        }
    };

    rows.into_iter().map(decode_row).collect()
}

#[async_trait]
impl Store for PostgresStore {
    type Transaction = PostgresTransaction;

    async fn fetch(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        fetch_rows(&self.pool, table, filter).await
    }

    async fn next_keys(&self, count: usize) -> Result<Vec<EntityKey>> {
        let keys = sqlx::query_scalar("SELECT nextval('entity_keys') FROM generate_series(1, $1)")
            .bind(count as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn begin(&self) -> Result<Self::Transaction> {
        Ok(PostgresTransaction {
            tx: self.pool.begin().await?,
        })
    }
}

/// An open database transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

async fn current_version(
    conn: &mut PgConnection,
    table: &str,
    key: EntityKey,
) -> Result<Option<ConcurrencyToken>> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM entity_rows WHERE table_name = $1 AND key = $2")
            .bind(table)
            .bind(key)
            .fetch_optional(conn)
            .await?;
    Ok(version.map(ConcurrencyToken::new))
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn fetch(&mut self, table: &str, filter: &RowFilter) -> Result<Vec<Row>> {
        fetch_rows(&mut *self.tx, table, filter).await
    }

    async fn apply(&mut self, op: &WriteOp) -> Result<Option<ConcurrencyToken>> {
        match op {
            WriteOp::Insert {
                table,
                key,
                parent,
                body,
            } => {
                let inserted: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO entity_rows (table_name, key, parent_key, version, body)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (table_name, key) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(*table)
                .bind(key)
                .bind(parent)
                .bind(ConcurrencyToken::first().as_i64())
                .bind(body)
                .fetch_optional(&mut *self.tx)
                .await?;

                match inserted {
                    Some(version) => Ok(Some(ConcurrencyToken::new(version))),
                    None => Err(StoreError::ConcurrencyConflict {
                        table: table.to_string(),
                        key: *key,
                        expected: ConcurrencyToken::initial(),
                        actual: current_version(&mut self.tx, table, *key).await?,
                    }),
                }
            }
            WriteOp::Update {
                table,
                key,
                parent,
                expected,
                body,
            } => {
                let updated: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE entity_rows
                    SET version = version + 1, parent_key = $3, body = $4, updated_at = NOW()
                    WHERE table_name = $1 AND key = $2 AND version = $5
                    RETURNING version
                    "#,
                )
                .bind(*table)
                .bind(key)
                .bind(parent)
                .bind(body)
                .bind(expected.as_i64())
                .fetch_optional(&mut *self.tx)
                .await?;

                match updated {
                    Some(version) => Ok(Some(ConcurrencyToken::new(version))),
                    None => Err(StoreError::ConcurrencyConflict {
                        table: table.to_string(),
                        key: *key,
                        expected: *expected,
                        actual: current_version(&mut self.tx, table, *key).await?,
                    }),
                }
            }
            WriteOp::Delete {
                table,
                key,
                expected,
            } => {
                let deleted = sqlx::query(
                    "DELETE FROM entity_rows WHERE table_name = $1 AND key = $2 AND version = $3",
                )
                .bind(*table)
                .bind(key)
                .bind(expected.as_i64())
                .execute(&mut *self.tx)
                .await?;

                if deleted.rows_affected() == 0 {
                    return Err(StoreError::ConcurrencyConflict {
                        table: table.to_string(),
                        key: *key,
                        expected: *expected,
                        actual: current_version(&mut self.tx, table, *key).await?,
                    });
                }
                Ok(None)
            }
            WriteOp::ReplaceChildren {
                table,
                parent,
                rows,
            } => {
                let keep: Vec<EntityKey> = rows.iter().map(|row| row.key).collect();
                sqlx::query(
                    r#"
                    DELETE FROM entity_rows
                    WHERE table_name = $1 AND parent_key = $2 AND NOT (key = ANY($3))
                    "#,
                )
                .bind(*table)
                .bind(parent)
                .bind(&keep)
                .execute(&mut *self.tx)
                .await?;

                for row in rows {
                    sqlx::query(
                        r#"
                        INSERT INTO entity_rows (table_name, key, parent_key, version, body)
                        VALUES ($1, $2, $3, $4, $5)
                        ON CONFLICT (table_name, key) DO UPDATE
                        SET parent_key = EXCLUDED.parent_key,
                            body = EXCLUDED.body,
                            version = entity_rows.version + 1,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(*table)
                    .bind(row.key)
                    .bind(parent)
                    .bind(ConcurrencyToken::first().as_i64())
                    .bind(&row.body)
                    .execute(&mut *self.tx)
                    .await?;
                }
                Ok(None)
            }
            WriteOp::DeleteChildren { table, parent } => {
                sqlx::query("DELETE FROM entity_rows WHERE table_name = $1 AND parent_key = $2")
                    .bind(*table)
                    .bind(parent)
                    .execute(&mut *self.tx)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
