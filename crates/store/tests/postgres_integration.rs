//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use serial_test::serial;
use store::{
    CancellationToken, ChildRow, ConcurrencyToken, Entity, EntityKey, PostgresStore, RowFilter,
    Specification, Store, StoreError, StoreTransaction, UnitOfWork, WriteOp,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let store = PostgresStore::connect(&connection_string, 1).await.unwrap();
            store.run_migrations().await.unwrap();
            store.pool().close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and an empty table
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;
    let store = PostgresStore::connect(&info.connection_string, 5)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE entity_rows")
        .execute(store.pool())
        .await
        .unwrap();

    store
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    id: EntityKey,
    value: i64,
    #[serde(skip)]
    token: ConcurrencyToken,
}

impl Entity for Counter {
    const TABLE: &'static str = "counters";

    fn key(&self) -> EntityKey {
        self.id
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = key;
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }
}

fn insert(key: EntityKey) -> WriteOp {
    WriteOp::Insert {
        table: "things",
        key,
        parent: None,
        body: json!({"key": key}),
    }
}

#[tokio::test]
#[serial]
async fn insert_then_update_bumps_version() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    let first = tx.apply(&insert(1)).await.unwrap();
    let second = tx
        .apply(&WriteOp::Update {
            table: "things",
            key: 1,
            parent: None,
            expected: ConcurrencyToken::first(),
            body: json!({"key": 1, "updated": true}),
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(first, Some(ConcurrencyToken::first()));
    assert_eq!(second, Some(ConcurrencyToken::first().next()));

    let rows = store.fetch("things", &RowFilter::Keys(vec![1])).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].body["updated"], true);
}

#[tokio::test]
#[serial]
async fn stale_update_reports_actual_version() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    tx.apply(&insert(1)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let err = tx
        .apply(&WriteOp::Update {
            table: "things",
            key: 1,
            parent: None,
            expected: ConcurrencyToken::new(7),
            body: json!({}),
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StoreError::ConcurrencyConflict { actual: Some(actual), .. } if actual == ConcurrencyToken::first()
    ));
}

#[tokio::test]
#[serial]
async fn duplicate_insert_conflicts() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    tx.apply(&insert(1)).await.unwrap();
    let err = tx.apply(&insert(1)).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
#[serial]
async fn rolled_back_transaction_leaves_no_rows() {
    let store = get_test_store().await;

    let mut tx = store.begin().await.unwrap();
    tx.apply(&insert(1)).await.unwrap();
    tx.rollback().await.unwrap();

    let rows = store.fetch("things", &RowFilter::All).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
#[serial]
async fn replace_children_syncs_the_child_set() {
    let store = get_test_store().await;
    let children = |keys: &[EntityKey]| WriteOp::ReplaceChildren {
        table: "parts",
        parent: 1,
        rows: keys
            .iter()
            .map(|key| ChildRow {
                key: *key,
                body: json!({"key": key}),
            })
            .collect(),
    };

    let mut tx = store.begin().await.unwrap();
    tx.apply(&children(&[10, 11])).await.unwrap();
    tx.apply(&children(&[11, 12])).await.unwrap();
    tx.commit().await.unwrap();

    let rows = store
        .fetch("parts", &RowFilter::Parents(vec![1]))
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.key).collect::<Vec<_>>(), vec![11, 12]);

    let mut tx = store.begin().await.unwrap();
    tx.apply(&WriteOp::DeleteChildren {
        table: "parts",
        parent: 1,
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert!(store.fetch("parts", &RowFilter::All).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn key_sequence_never_repeats() {
    let store = get_test_store().await;
    let first = store.next_keys(3).await.unwrap();
    let second = store.next_keys(2).await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 2);
    assert!(first.iter().all(|k| !second.contains(k)));
}

#[tokio::test]
#[serial]
async fn concurrent_units_of_work_one_wins() {
    let store = get_test_store().await;
    let cancel = CancellationToken::new();

    let mut uow = UnitOfWork::new(store.clone());
    let counter = uow
        .repository::<Counter>()
        .create(Counter::default(), &cancel)
        .await
        .unwrap();
    uow.save_changes(&cancel).await.unwrap();

    let id = counter.id;
    let bump = |delta: i64| {
        let store = store.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut uow = UnitOfWork::new(store);
            let mut repo = uow.repository::<Counter>();
            let mut counter = repo
                .first_or_default(&Specification::for_key(id), &cancel)
                .await?
                .unwrap();
            counter.value += delta;
            repo.update(&counter)?;
            tokio::task::yield_now().await;
            uow.save_changes(&cancel).await
        })
    };

    let (a, b) = tokio::join!(bump(1), bump(2));
    let outcomes = [a.unwrap(), b.unwrap()];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();

    // Both may read version 1; whichever commits second must be rejected.
    assert!(wins >= 1);
    assert_eq!(wins + conflicts, 2);

    let mut check = UnitOfWork::new(store.clone());
    let stored = check
        .repository::<Counter>()
        .first_or_default(&Specification::for_key(id), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.token.as_i64(), 1 + wins as i64);
}
