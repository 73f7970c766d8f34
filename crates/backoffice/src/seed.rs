//! Catalog seeding from a JSON file.
//!
//! The file holds an array of products:
//!
//! ```json
//! [{ "name": "Widget", "description": "A widget", "price_cents": 1999, "stock": 25 }]
//! ```
//!
//! Seeding is idempotent by product name, so a restart does not duplicate
//! the catalog.

use std::collections::HashSet;
use std::path::Path;

use common::Money;
use domain::{DomainError, Product, StockLedger};
use serde::Deserialize;
use store::{CancellationToken, Store};
use tracing::info;

use crate::error::{BackofficeError, Result};

/// One product of the seed catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price_cents: i64,
    pub stock: i64,
}

/// Reads and parses a catalog file.
pub async fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BackofficeError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&json).map_err(|source| BackofficeError::CatalogParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates every catalog product whose name is not in the store yet.
///
/// Returns the number of products created.
#[tracing::instrument(skip_all, fields(entries = entries.len()))]
pub async fn seed_catalog<S: Store>(
    ledger: &StockLedger<S>,
    entries: &[CatalogEntry],
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut known: HashSet<String> = ledger
        .list_products(cancel)
        .await?
        .into_iter()
        .map(|p| p.name.to_lowercase())
        .collect();

    let mut created = 0;
    for entry in entries {
        if !known.insert(entry.name.to_lowercase()) {
            continue;
        }
        let product = Product::new(
            entry.name.as_str(),
            entry.description.as_str(),
            Money::from_cents(entry.price_cents),
            entry.stock,
        )
        .map_err(DomainError::from)?;
        ledger.create_product(product, cancel).await?;
        created += 1;
    }

    info!(created, skipped = entries.len() - created, "Catalog seeded");
    Ok(created)
}
