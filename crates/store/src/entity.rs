//! Traits entities implement to be persisted through a unit of work.

use chrono::{DateTime, Utc};
use common::EntityKey;
use serde::{Serialize, de::DeserializeOwned};

use crate::ConcurrencyToken;
use crate::store::ChildRow;

/// A persistable entity (aggregate root or independent row).
///
/// The root row body is the serde representation of the entity. Fields that
/// belong to other rows (owned children, included references) must be
/// `#[serde(skip)]` and are written through [`Entity::owned_rows`] or loaded
/// through includes.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name of the root rows.
    const TABLE: &'static str;

    /// Tables of owned child collections, deleted together with the root.
    const OWNED_TABLES: &'static [&'static str] = &[];

    fn key(&self) -> EntityKey;

    fn set_key(&mut self, key: EntityKey);

    fn token(&self) -> ConcurrencyToken;

    fn set_token(&mut self, token: ConcurrencyToken);

    /// Key of the row this entity hangs off, used for parent-filtered loads.
    fn parent_key(&self) -> Option<EntityKey> {
        None
    }

    /// Number of owned child rows still waiting for a key.
    fn unkeyed_children(&self) -> usize {
        0
    }

    /// Assigns keys to owned child rows and returns every loaded owned
    /// collection. Collections that were not loaded must be left out so the
    /// stored children stay untouched.
    fn owned_rows(
        &mut self,
        _keys: &mut dyn Iterator<Item = EntityKey>,
    ) -> Result<Vec<OwnedRows>, serde_json::Error> {
        Ok(Vec::new())
    }

    /// Audit hook target, if this entity carries audit timestamps.
    fn auditable(&mut self) -> Option<&mut dyn Auditable> {
        None
    }
}

/// An owned child collection as it should be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedRows {
    pub table: &'static str,
    pub rows: Vec<ChildRow>,
}

/// Entities stamped by the unit of work right before their rows are written.
pub trait Auditable {
    fn touch_created(&mut self, at: DateTime<Utc>);

    fn touch_updated(&mut self, at: DateTime<Utc>);
}

/// A read model built straight from a loaded entity. Projections are never
/// tracked.
pub trait Projection<E>: Sized + Send {
    fn project(entity: &E) -> Self;
}
