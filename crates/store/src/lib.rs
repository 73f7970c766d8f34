//! Specification-driven data access.
//!
//! Entities are read through [`Repository`] instances described by
//! [`Specification`]s and written through a [`UnitOfWork`], which stages
//! changes and flushes them atomically. Every row carries a
//! [`ConcurrencyToken`] that the store replaces on each write; a write with a
//! stale token fails with [`StoreError::ConcurrencyConflict`].

pub mod cancel;
pub mod clock;
pub mod entity;
pub mod error;
pub mod include;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod specification;
pub mod store;
pub mod token;
pub mod unit_of_work;

pub use common::EntityKey;
pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::{Auditable, Entity, OwnedRows, Projection};
pub use error::{Result, StoreError};
pub use include::{Include, RowSource, children_by_parent, rows_by_key};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use repository::Repository;
pub use specification::{Criteria, Specification};
pub use store::{ChildRow, Row, RowFilter, Store, StoreTransaction, WriteOp};
pub use token::ConcurrencyToken;
pub use tokio_util::sync::CancellationToken;
pub use unit_of_work::UnitOfWork;
