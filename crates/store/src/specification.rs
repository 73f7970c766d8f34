use std::sync::Arc;

use common::EntityKey;

use crate::include::Include;

/// Predicate over an entity type.
pub type Criteria<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Describes which entities of one type to read and in what shape.
///
/// A specification is assembled with the consuming builder methods and is
/// immutable afterwards: repositories only ever borrow it, and [`and`]
/// returns a new specification instead of changing the receiver.
///
/// Criteria see the root row only; related data brought in by includes is
/// loaded after filtering.
///
/// [`and`]: Specification::and
pub struct Specification<E> {
    criteria: Option<Criteria<E>>,
    keys: Option<Vec<EntityKey>>,
    includes: Vec<Arc<dyn Include<E>>>,
    no_tracking: bool,
}

impl<E> Clone for Specification<E> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            keys: self.keys.clone(),
            includes: self.includes.clone(),
            no_tracking: self.no_tracking,
        }
    }
}

impl<E> Default for Specification<E> {
    fn default() -> Self {
        Self {
            criteria: None,
            keys: None,
            includes: Vec::new(),
            no_tracking: false,
        }
    }
}

impl<E> std::fmt::Debug for Specification<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("has_criteria", &self.criteria.is_some())
            .field("keys", &self.keys)
            .field(
                "includes",
                &self.includes.iter().map(|i| i.path()).collect::<Vec<_>>(),
            )
            .field("no_tracking", &self.no_tracking)
            .finish()
    }
}

impl<E: Send + 'static> Specification<E> {
    /// Creates a specification matching every entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a specification matching entities that satisfy `predicate`.
    pub fn matching(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self::new().filter(predicate)
    }

    /// Creates a specification for a single key.
    pub fn for_key(key: impl Into<EntityKey>) -> Self {
        Self {
            keys: Some(vec![key.into()]),
            ..Self::default()
        }
    }

    /// Creates a specification for a set of keys.
    pub fn for_keys(keys: impl IntoIterator<Item = EntityKey>) -> Self {
        Self {
            keys: Some(keys.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Narrows the criteria during assembly.
    pub fn filter(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.criteria = Some(Self::conjoin(self.criteria.take(), Arc::new(predicate)));
        self
    }

    /// Appends a relation-expansion step. Steps run in the order given.
    pub fn include(mut self, include: impl Include<E> + 'static) -> Self {
        self.includes.push(Arc::new(include));
        self
    }

    /// Appends a step nested under a previously included relation. The step's
    /// `depends_on` path must already be part of this specification.
    pub fn then_include(self, include: impl Include<E> + 'static) -> Self {
        self.include(include)
    }

    /// Marks loaded entities as read-only: they cannot be staged for update
    /// or removal.
    pub fn as_no_tracking(mut self) -> Self {
        self.no_tracking = true;
        self
    }

    /// Returns a new specification whose criteria are this one's ANDed with
    /// `predicate`. The receiver is left untouched.
    pub fn and(&self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            criteria: Some(Self::conjoin(self.criteria.clone(), Arc::new(predicate))),
            ..self.clone()
        }
    }

    fn conjoin(existing: Option<Criteria<E>>, next: Criteria<E>) -> Criteria<E> {
        match existing {
            None => next,
            Some(existing) => Arc::new(move |entity: &E| existing(entity) && next(entity)),
        }
    }
}

impl<E> Specification<E> {
    /// Returns true if `entity` passes the criteria. The key filter is
    /// checked against `key`.
    pub fn is_satisfied_by(&self, key: EntityKey, entity: &E) -> bool {
        self.keys.as_ref().is_none_or(|keys| keys.contains(&key))
            && self.criteria.as_ref().is_none_or(|criteria| criteria(entity))
    }

    pub fn criteria(&self) -> Option<&Criteria<E>> {
        self.criteria.as_ref()
    }

    pub fn keys(&self) -> Option<&[EntityKey]> {
        self.keys.as_deref()
    }

    pub fn includes(&self) -> &[Arc<dyn Include<E>>] {
        &self.includes
    }

    pub fn include_paths(&self) -> Vec<&'static str> {
        self.includes.iter().map(|i| i.path()).collect()
    }

    pub fn is_no_tracking(&self) -> bool {
        self.no_tracking
    }
}
