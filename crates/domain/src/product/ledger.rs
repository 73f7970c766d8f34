//! Stock ledger: product creation, concurrency-checked stock adjustment and
//! removal of unreferenced products.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common::ProductId;
use store::{
    CancellationToken, Clock, ConcurrencyToken, Entity, Store, StoreError, SystemClock, UnitOfWork,
};
use tracing::{info, warn};

use super::{Product, ProductError, ProductSummary, StockChange};
use crate::basket::BasketItem;
use crate::error::{DomainError, Result};
use crate::order::OrderItem;
use crate::{refreshed, specifications};

/// Service owning every write to product stock.
pub struct StockLedger<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> StockLedger<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::with_clock(self.store.clone(), self.clock.clone())
    }

    /// Adds a product to the catalog.
    #[tracing::instrument(skip(self, product, cancel), fields(name = %product.name()))]
    pub async fn create_product(
        &self,
        product: Product,
        cancel: &CancellationToken,
    ) -> Result<Product> {
        let mut uow = self.unit_of_work();
        let created = uow.repository::<Product>().create(product, cancel).await?;
        uow.save_changes(cancel).await?;

        info!(product_id = %created.id(), "Product created");
        Ok(refreshed(&uow, created))
    }

    /// Loads a read-only copy of a product.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_product(
        &self,
        product_id: ProductId,
        cancel: &CancellationToken,
    ) -> Result<Product> {
        let mut uow = self.unit_of_work();
        uow.repository::<Product>()
            .first_or_default(&specifications::product_by_id_no_tracking(product_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Product", product_id))
    }

    pub async fn list_products(&self, cancel: &CancellationToken) -> Result<Vec<ProductSummary>> {
        let mut uow = self.unit_of_work();
        Ok(uow
            .repository::<Product>()
            .list_projected(&specifications::all_products(), cancel)
            .await?)
    }

    /// Applies a signed stock delta if `expected` is still the stored token.
    ///
    /// Returns the product's new token. A stale `expected` token, or another
    /// writer committing between the read and the write, yields a
    /// concurrency conflict. This never retries.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn adjust_stock(
        &self,
        product_id: ProductId,
        delta: i64,
        expected: ConcurrencyToken,
        cancel: &CancellationToken,
    ) -> Result<ConcurrencyToken> {
        let mut uow = self.unit_of_work();
        let mut products = uow.repository::<Product>();
        let mut product = products
            .first_or_default(&specifications::product_by_id(product_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Product", product_id))?;

        if product.concurrency_token() != expected {
            metrics::counter!("stock_conflicts_total").increment(1);
            return Err(StoreError::ConcurrencyConflict {
                table: Product::TABLE.to_string(),
                key: product_id.key(),
                expected,
                actual: Some(product.concurrency_token()),
            }
            .into());
        }

        product.adjust_stock(delta)?;
        products.update(&product)?;
        uow.save_changes(cancel).await?;
        metrics::counter!("stock_adjustments_total").increment(1);

        uow.current_token::<Product>(product_id.key())
            .ok_or_else(|| {
                StoreError::Untracked {
                    table: Product::TABLE.to_string(),
                    key: product_id.key(),
                }
                .into()
            })
    }

    /// Reloads and retries [`adjust_stock`](Self::adjust_stock) on conflict,
    /// up to `max_attempts` times in total.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn adjust_stock_with_retry(
        &self,
        product_id: ProductId,
        delta: i64,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<ConcurrencyToken> {
        let mut attempt = 1;
        loop {
            let product = self.get_product(product_id, cancel).await?;
            match self
                .adjust_stock(product_id, delta, product.concurrency_token(), cancel)
                .await
            {
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    warn!(%product_id, attempt, "Stock adjustment conflicted, retrying");
                    metrics::counter!("stock_adjustment_retries_total").increment(1);
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Deletes a product that no order references. Basket lines pointing at
    /// it are removed in the same write.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete_product(
        &self,
        product_id: ProductId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut uow = self.unit_of_work();
        let product = uow
            .repository::<Product>()
            .first_or_default(&specifications::product_by_id(product_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Product", product_id))?;

        let referenced = uow
            .repository::<OrderItem>()
            .any(&specifications::order_items_for_product(product_id), cancel)
            .await?;
        if referenced {
            return Err(ProductError::InUse.into());
        }

        let mut baskets = uow.repository::<BasketItem>();
        let lines = baskets
            .list(&specifications::basket_items_for_product(product_id), cancel)
            .await?;
        baskets.remove_range(&lines)?;
        uow.repository::<Product>().remove(&product)?;
        uow.save_changes(cancel).await?;

        info!(%product_id, basket_lines = lines.len(), "Product deleted");
        Ok(())
    }
}

/// Loads the touched products into `uow` and stages their stock updates.
///
/// Changes to the same product are summed first, so each product gets one
/// guarded update. Nothing is written until the caller saves `uow`, which
/// makes the stock movement commit or fail with the caller's other writes.
pub(crate) async fn stage_stock_changes<S: Store>(
    uow: &mut UnitOfWork<S>,
    changes: &[StockChange],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut deltas: BTreeMap<ProductId, i64> = BTreeMap::new();
    for change in changes {
        *deltas.entry(change.product_id).or_default() += change.delta;
    }
    deltas.retain(|_, delta| *delta != 0);
    if deltas.is_empty() {
        return Ok(());
    }

    let mut products = uow.repository::<Product>();
    let mut loaded: HashMap<ProductId, Product> = products
        .list(&specifications::products_by_ids(deltas.keys().copied()), cancel)
        .await?
        .into_iter()
        .map(|product| (product.id(), product))
        .collect();

    for (product_id, delta) in deltas {
        let product = loaded
            .get_mut(&product_id)
            .ok_or_else(|| DomainError::not_found("Product", product_id))?;
        product.adjust_stock(delta)?;
        products.update(product)?;
    }
    metrics::counter!("stock_adjustments_total").increment(loaded.len() as u64);
    Ok(())
}
