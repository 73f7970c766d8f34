use std::marker::PhantomData;

use tokio_util::sync::CancellationToken;

use crate::entity::{Entity, Projection};
use crate::include::RowSource;
use crate::specification::Specification;
use crate::store::{RowFilter, Store};
use crate::unit_of_work::{Change, Staged, UnitOfWork};
use crate::{ConcurrencyToken, Result, StoreError};

/// Data access for one entity type, bound to a unit of work.
///
/// Reads go to the store (or the open transaction) immediately. Writes are
/// only staged and take effect on [`UnitOfWork::save_changes`].
pub struct Repository<'a, S: Store, E: Entity> {
    uow: &'a mut UnitOfWork<S>,
    _entity: PhantomData<fn() -> E>,
}

impl<'a, S: Store, E: Entity> Repository<'a, S, E> {
    pub(crate) fn new(uow: &'a mut UnitOfWork<S>) -> Self {
        Self {
            uow,
            _entity: PhantomData,
        }
    }

    /// Returns the first entity matching `spec` in key order, or `None`.
    pub async fn first_or_default(
        &mut self,
        spec: &Specification<E>,
        cancel: &CancellationToken,
    ) -> Result<Option<E>> {
        let entities = self.load(spec, Some(1), true, cancel).await?;
        Ok(entities.into_iter().next())
    }

    /// Returns every entity matching `spec` in key order.
    pub async fn list(
        &mut self,
        spec: &Specification<E>,
        cancel: &CancellationToken,
    ) -> Result<Vec<E>> {
        self.load(spec, None, true, cancel).await
    }

    /// Returns a read model for every match. Nothing is tracked.
    pub async fn list_projected<R: Projection<E>>(
        &mut self,
        spec: &Specification<E>,
        cancel: &CancellationToken,
    ) -> Result<Vec<R>> {
        let entities = self.load(spec, None, false, cancel).await?;
        Ok(entities.iter().map(R::project).collect())
    }

    /// Selects one value from the first match.
    pub async fn get_value<V>(
        &mut self,
        spec: &Specification<E>,
        selector: impl Fn(&E) -> V + Send,
        cancel: &CancellationToken,
    ) -> Result<Option<V>> {
        let entities = self.load(spec, Some(1), false, cancel).await?;
        Ok(entities.first().map(selector))
    }

    /// Selects one value from every match.
    pub async fn list_values<V>(
        &mut self,
        spec: &Specification<E>,
        selector: impl Fn(&E) -> V + Send,
        cancel: &CancellationToken,
    ) -> Result<Vec<V>> {
        let entities = self.load(spec, None, false, cancel).await?;
        Ok(entities.iter().map(selector).collect())
    }

    /// Returns true if at least one entity matches. Includes are not loaded.
    pub async fn any(&mut self, spec: &Specification<E>, cancel: &CancellationToken) -> Result<bool> {
        Ok(!self.roots(spec, Some(1), cancel).await?.is_empty())
    }

    /// Stages an insert. A key is reserved right away when the entity has
    /// none, so the returned copy can be referenced by other staged rows.
    pub async fn create(&mut self, mut entity: E, cancel: &CancellationToken) -> Result<E> {
        if entity.key() == 0 {
            entity.set_key(self.uow.allocate_key(cancel).await?);
        }
        entity.set_token(ConcurrencyToken::initial());
        self.uow
            .tracked
            .insert((E::TABLE, entity.key()), entity.token());
        self.uow
            .staged
            .push(Box::new(Staged(Change::Create(entity.clone()))));
        Ok(entity)
    }

    /// Stages an update guarded by the entity's concurrency token.
    pub fn update(&mut self, entity: &E) -> Result<()> {
        self.ensure_tracked(entity)?;
        match self.staged_change(entity) {
            Some(Change::Create(staged)) | Some(Change::Update(staged)) => {
                *staged = entity.clone();
            }
            Some(Change::Remove(_)) => {
                return Err(StoreError::InvalidBatch(format!(
                    "{} {} is already staged for removal",
                    E::TABLE,
                    entity.key()
                )));
            }
            None => self
                .uow
                .staged
                .push(Box::new(Staged(Change::Update(entity.clone())))),
        }
        Ok(())
    }

    pub fn update_range<'e>(&mut self, entities: impl IntoIterator<Item = &'e E>) -> Result<()> {
        for entity in entities {
            self.update(entity)?;
        }
        Ok(())
    }

    /// Stages a removal guarded by the entity's concurrency token. Owned
    /// children are removed with it.
    pub fn remove(&mut self, entity: &E) -> Result<()> {
        self.ensure_tracked(entity)?;
        let never_written = match self.staged_change(entity) {
            Some(change) => match change {
                Change::Create(_) => true,
                Change::Update(_) => {
                    *change = Change::Remove(entity.clone());
                    false
                }
                Change::Remove(_) => false,
            },
            None => {
                self.uow
                    .staged
                    .push(Box::new(Staged(Change::Remove(entity.clone()))));
                false
            }
        };

        if never_written {
            let target = (E::TABLE, entity.key());
            self.uow.staged.retain(|write| write.target() != target);
            self.uow.tracked.remove(&target);
        }
        Ok(())
    }

    pub fn remove_range<'e>(&mut self, entities: impl IntoIterator<Item = &'e E>) -> Result<()> {
        for entity in entities {
            self.remove(entity)?;
        }
        Ok(())
    }

    fn ensure_tracked(&self, entity: &E) -> Result<()> {
        if self.uow.tracked.contains_key(&(E::TABLE, entity.key())) {
            Ok(())
        } else {
            Err(StoreError::Untracked {
                table: E::TABLE.to_string(),
                key: entity.key(),
            })
        }
    }

    fn staged_change(&mut self, entity: &E) -> Option<&mut Change<E>> {
        let target = (E::TABLE, entity.key());
        self.uow
            .staged
            .iter_mut()
            .find(|write| write.target() == target)
            .and_then(|write| write.as_any_mut().downcast_mut::<Staged<E>>())
            .map(|staged| &mut staged.0)
    }

    /// Loads root rows matching the key filter and criteria, in key order.
    async fn roots(
        &mut self,
        spec: &Specification<E>,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<E>> {
        let filter = spec
            .keys()
            .map_or(RowFilter::All, |keys| RowFilter::Keys(keys.to_vec()));
        let rows = self.uow.rows(cancel).fetch(E::TABLE, filter).await?;

        let mut entities = Vec::new();
        for row in rows {
            if limit.is_some_and(|limit| entities.len() >= limit) {
                break;
            }
            let mut entity: E = row.decode()?;
            entity.set_key(row.key);
            entity.set_token(row.token);
            if spec.is_satisfied_by(row.key, &entity) {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    async fn load(
        &mut self,
        spec: &Specification<E>,
        limit: Option<usize>,
        track: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<E>> {
        check_includes(spec)?;
        let mut entities = self.roots(spec, limit, cancel).await?;

        if !entities.is_empty() {
            let mut rows = self.uow.rows(cancel);
            for include in spec.includes() {
                include.load(&mut entities, &mut rows).await?;
            }
        }

        if track && !spec.is_no_tracking() {
            for entity in &entities {
                self.uow
                    .tracked
                    .insert((E::TABLE, entity.key()), entity.token());
            }
        }
        Ok(entities)
    }
}

/// Nested steps must follow the step they expand.
fn check_includes<E>(spec: &Specification<E>) -> Result<()> {
    let mut loaded: Vec<&str> = Vec::new();
    for include in spec.includes() {
        if let Some(parent) = include.depends_on()
            && !loaded.contains(&parent)
        {
            return Err(StoreError::InvalidInclude(format!(
                "{} requires {parent} to be included first",
                include.path()
            )));
        }
        loaded.push(include.path());
    }
    Ok(())
}
