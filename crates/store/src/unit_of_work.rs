use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EntityKey;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::cancellable;
use crate::clock::{Clock, SystemClock};
use crate::entity::Entity;
use crate::include::RowSource;
use crate::repository::Repository;
use crate::store::{Row, RowFilter, Store, StoreTransaction, WriteOp, validate_batch};
use crate::{ConcurrencyToken, Result, StoreError};

type Target = (&'static str, EntityKey);

/// Tracks loaded entities and staged writes for one logical request.
///
/// Nothing reaches the store until [`save_changes`](Self::save_changes),
/// which writes every staged change in a single transaction. When an
/// explicit transaction is open, reads and writes of every repository go
/// through it until it is committed or rolled back.
///
/// A unit of work is not shared between tasks; concurrent requests each use
/// their own and rely on concurrency tokens to detect conflicting writes.
pub struct UnitOfWork<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
    pub(crate) tracked: HashMap<Target, ConcurrencyToken>,
    pub(crate) staged: Vec<Box<dyn PendingWrite>>,
    transaction: Option<S::Transaction>,
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates a unit of work that stamps audit times from `clock`.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tracked: HashMap::new(),
            staged: Vec::new(),
            transaction: None,
        }
    }

    /// Returns the repository for one entity type.
    pub fn repository<E: Entity>(&mut self) -> Repository<'_, S, E> {
        Repository::new(self)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn is_tracked<E: Entity>(&self, key: EntityKey) -> bool {
        self.tracked.contains_key(&(E::TABLE, key))
    }

    /// Token of a tracked entity as last loaded or written by this unit of work.
    pub fn current_token<E: Entity>(&self, key: EntityKey) -> Option<ConcurrencyToken> {
        self.tracked.get(&(E::TABLE, key)).copied()
    }

    pub(crate) async fn allocate_key(&self, cancel: &CancellationToken) -> Result<EntityKey> {
        let keys = cancellable(cancel, self.store.next_keys(1)).await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| StoreError::InvalidBatch("store returned no key".to_string()))
    }

    pub(crate) fn rows<'a>(&'a mut self, cancel: &'a CancellationToken) -> UowRows<'a, S> {
        UowRows {
            store: &self.store,
            transaction: self.transaction.as_mut(),
            cancel,
        }
    }

    /// Opens an explicit transaction spanning several `save_changes` calls.
    pub async fn begin_transaction(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.transaction.is_some() {
            return Err(StoreError::TransactionAlreadyActive);
        }
        let transaction = cancellable(cancel, self.store.begin()).await?;
        self.transaction = Some(transaction);
        Ok(())
    }

    /// Commits the explicit transaction. Staged changes must be saved first;
    /// otherwise the commit is refused and the transaction stays open.
    pub async fn commit_transaction(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.transaction.is_none() {
            return Err(StoreError::NoActiveTransaction);
        }
        if self.has_changes() {
            return Err(StoreError::UnsavedChanges {
                staged: self.staged.len(),
            });
        }
        let transaction = self
            .transaction
            .take()
            .ok_or(StoreError::NoActiveTransaction)?;
        if let Err(error) = cancellable(cancel, transaction.commit()).await {
            // Tokens recorded inside the transaction no longer describe the store.
            self.tracked.clear();
            return Err(error);
        }
        Ok(())
    }

    /// Discards every write made inside the explicit transaction, along with
    /// staged changes and tracking state.
    ///
    /// A cancelled rollback drops the transaction, which rolls it back too.
    pub async fn rollback_transaction(&mut self, cancel: &CancellationToken) -> Result<()> {
        let transaction = self
            .transaction
            .take()
            .ok_or(StoreError::NoActiveTransaction)?;
        self.staged.clear();
        self.tracked.clear();
        cancellable(cancel, transaction.rollback()).await
    }

    /// Writes every staged change atomically and returns the number of
    /// entities written.
    ///
    /// Staged changes are consumed whether or not the write succeeds. On
    /// failure nothing is persisted; inside an explicit transaction the whole
    /// transaction is rolled back.
    #[tracing::instrument(skip(self, cancel), fields(staged = self.staged.len()))]
    pub async fn save_changes(&mut self, cancel: &CancellationToken) -> Result<usize> {
        match self.flush(cancel).await {
            Ok(written) => Ok(written),
            Err(error) => {
                if error.is_conflict() {
                    metrics::counter!("store_conflicts_total").increment(1);
                    warn!(%error, "save rejected by concurrency check");
                }
                if let Some(transaction) = self.transaction.take() {
                    warn!("rolling back explicit transaction after failed save");
                    self.tracked.clear();
                    if let Err(rollback) = transaction.rollback().await {
                        warn!(error = %rollback, "rollback failed");
                    }
                }
                Err(error)
            }
        }
    }

    async fn flush(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let mut pending = std::mem::take(&mut self.staged);
        if pending.is_empty() {
            return Ok(0);
        }

        let child_keys: usize = pending.iter().map(|p| p.child_keys_needed()).sum();
        let mut keys = if child_keys > 0 {
            cancellable(cancel, self.store.next_keys(child_keys)).await?
        } else {
            Vec::new()
        }
        .into_iter();

        let now = self.clock.now();
        let mut ops = Vec::new();
        for write in &mut pending {
            ops.extend(write.build(now, &mut keys)?);
        }
        validate_batch(&ops)?;

        let outcomes = match self.transaction.as_mut() {
            Some(transaction) => cancellable(cancel, apply_all(transaction, &ops)).await?,
            None => cancellable(cancel, write_once(&self.store, &ops)).await?,
        };

        for (target, token) in &outcomes {
            match token {
                Some(token) => self.tracked.insert(*target, *token),
                None => self.tracked.remove(target),
            };
        }

        metrics::counter!("store_commits_total").increment(1);
        info!(entities = outcomes.len(), rows = ops.len(), "changes saved");
        Ok(outcomes.len())
    }
}

async fn apply_all<T: StoreTransaction>(
    transaction: &mut T,
    ops: &[WriteOp],
) -> Result<Vec<(Target, Option<ConcurrencyToken>)>> {
    let mut outcomes = Vec::new();
    for op in ops {
        let token = transaction.apply(op).await?;
        if let Some(target) = op.root_target() {
            outcomes.push((target, token));
        }
    }
    Ok(outcomes)
}

async fn write_once<S: Store>(
    store: &S,
    ops: &[WriteOp],
) -> Result<Vec<(Target, Option<ConcurrencyToken>)>> {
    let mut transaction = store.begin().await?;
    match apply_all(&mut transaction, ops).await {
        Ok(outcomes) => {
            transaction.commit().await?;
            Ok(outcomes)
        }
        Err(error) => {
            if let Err(rollback) = transaction.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(error)
        }
    }
}

/// Reads issued by repositories and include steps of one unit of work.
pub(crate) struct UowRows<'a, S: Store> {
    store: &'a S,
    transaction: Option<&'a mut S::Transaction>,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl<'a, S: Store> RowSource for UowRows<'a, S> {
    async fn fetch(&mut self, table: &'static str, filter: RowFilter) -> Result<Vec<Row>> {
        match self.transaction.as_deref_mut() {
            Some(transaction) => cancellable(self.cancel, transaction.fetch(table, &filter)).await,
            None => cancellable(self.cancel, self.store.fetch(table, &filter)).await,
        }
    }
}

/// A staged change, erased over the entity type.
pub(crate) trait PendingWrite: Send + Sync {
    fn target(&self) -> Target;

    fn child_keys_needed(&self) -> usize;

    fn build(
        &mut self,
        now: DateTime<Utc>,
        keys: &mut dyn Iterator<Item = EntityKey>,
    ) -> Result<Vec<WriteOp>>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) enum Change<E> {
    Create(E),
    Update(E),
    Remove(E),
}

pub(crate) struct Staged<E>(pub(crate) Change<E>);

impl<E: Entity> PendingWrite for Staged<E> {
    fn target(&self) -> Target {
        match &self.0 {
            Change::Create(e) | Change::Update(e) | Change::Remove(e) => (E::TABLE, e.key()),
        }
    }

    fn child_keys_needed(&self) -> usize {
        match &self.0 {
            Change::Create(e) | Change::Update(e) => e.unkeyed_children(),
            Change::Remove(_) => 0,
        }
    }

    fn build(
        &mut self,
        now: DateTime<Utc>,
        keys: &mut dyn Iterator<Item = EntityKey>,
    ) -> Result<Vec<WriteOp>> {
        let (entity, created) = match &mut self.0 {
            Change::Create(entity) => (entity, true),
            Change::Update(entity) => (entity, false),
            Change::Remove(entity) => {
                let mut ops: Vec<WriteOp> = E::OWNED_TABLES
                    .iter()
                    .map(|table| WriteOp::DeleteChildren {
                        table: *table,
                        parent: entity.key(),
                    })
                    .collect();
                ops.push(WriteOp::Delete {
                    table: E::TABLE,
                    key: entity.key(),
                    expected: entity.token(),
                });
                return Ok(ops);
            }
        };

        if let Some(audited) = entity.auditable() {
            if created {
                audited.touch_created(now);
            } else {
                audited.touch_updated(now);
            }
        }
        let owned = entity.owned_rows(keys)?;
        let body = serde_json::to_value(&*entity)?;

        let root = if created {
            WriteOp::Insert {
                table: E::TABLE,
                key: entity.key(),
                parent: entity.parent_key(),
                body,
            }
        } else {
            WriteOp::Update {
                table: E::TABLE,
                key: entity.key(),
                parent: entity.parent_key(),
                expected: entity.token(),
                body,
            }
        };

        let parent = entity.key();
        let mut ops = vec![root];
        ops.extend(owned.into_iter().map(|set| WriteOp::ReplaceChildren {
            table: set.table,
            parent,
            rows: set.rows,
        }));
        Ok(ops)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
