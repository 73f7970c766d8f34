//! Related-data inclusion steps.

use std::collections::HashMap;

use async_trait::async_trait;
use common::EntityKey;

use crate::{Result, Row, RowFilter};

/// Read access handed to include steps. Reads go through the same
/// transaction and cancellation signal as the query that triggered them.
#[async_trait]
pub trait RowSource: Send {
    async fn fetch(&mut self, table: &'static str, filter: RowFilter) -> Result<Vec<Row>>;
}

/// One relation-expansion step of a specification.
///
/// A step receives every entity matched by the query at once, so it loads
/// related rows in one round trip instead of one per entity.
#[async_trait]
pub trait Include<E>: Send + Sync {
    /// Dotted path of the relation, e.g. `items` or `items.product`.
    fn path(&self) -> &'static str;

    /// Path that must be loaded before this one, for nested steps.
    fn depends_on(&self) -> Option<&'static str> {
        None
    }

    async fn load(&self, entities: &mut [E], rows: &mut dyn RowSource) -> Result<()>;
}

/// Loads the rows of `table` whose parent is one of `parents`, grouped by parent.
pub async fn children_by_parent(
    rows: &mut dyn RowSource,
    table: &'static str,
    parents: Vec<EntityKey>,
) -> Result<HashMap<EntityKey, Vec<Row>>> {
    let mut grouped: HashMap<EntityKey, Vec<Row>> = HashMap::new();
    if parents.is_empty() {
        return Ok(grouped);
    }
    for row in rows.fetch(table, RowFilter::Parents(parents)).await? {
        if let Some(parent) = row.parent {
            grouped.entry(parent).or_default().push(row);
        }
    }
    Ok(grouped)
}

/// Loads the rows of `table` with the given keys, indexed by key.
pub async fn rows_by_key(
    rows: &mut dyn RowSource,
    table: &'static str,
    mut keys: Vec<EntityKey>,
) -> Result<HashMap<EntityKey, Row>> {
    keys.sort_unstable();
    keys.dedup();
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    Ok(rows
        .fetch(table, RowFilter::Keys(keys))
        .await?
        .into_iter()
        .map(|row| (row.key, row))
        .collect())
}
