//! Shopping basket: pre-order staging of product lines per user.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{BasketItemId, EntityKey, ProductId, UserId};
use serde::{Deserialize, Serialize};
use store::{
    Auditable, CancellationToken, Clock, ConcurrencyToken, Entity, Specification, Store,
    SystemClock, UnitOfWork,
};
use thiserror::Error;
use tracing::info;

use crate::error::{DomainError, Result};
use crate::order::{DeliveryAddress, Order};
use crate::product::{Product, ProductError, ProductSummary, stage_stock_changes};
use crate::{ErrorKind, refreshed, specifications};

/// Errors that can occur during basket operations.
#[derive(Debug, Error)]
pub enum BasketError {
    #[error("Basket is empty")]
    Empty,

    #[error("Invalid quantity: {quantity} (must be positive and keep the line within range)")]
    InvalidQuantity { quantity: u32 },

    #[error("Product {product_id} is not in the basket")]
    ItemNotFound { product_id: ProductId },
}

impl BasketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BasketError::Empty => ErrorKind::InvariantViolation,
            BasketError::InvalidQuantity { .. } => ErrorKind::Validation,
            BasketError::ItemNotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            BasketError::Empty => 5001,
            BasketError::InvalidQuantity { .. } => 5002,
            BasketError::ItemNotFound { .. } => 5003,
        }
    }
}

/// One product line in a user's basket. Holding a line does not reserve
/// stock; stock is taken at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketItem {
    id: BasketItemId,
    user_id: UserId,
    product_id: ProductId,
    quantity: u32,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    token: ConcurrencyToken,

    #[serde(skip)]
    product: Option<ProductSummary>,
}

impl BasketItem {
    pub fn new(
        user_id: UserId,
        product_id: ProductId,
        quantity: u32,
    ) -> std::result::Result<Self, BasketError> {
        if quantity == 0 {
            return Err(BasketError::InvalidQuantity { quantity });
        }
        Ok(Self {
            id: BasketItemId::default(),
            user_id,
            product_id,
            quantity,
            created_at: None,
            updated_at: None,
            token: ConcurrencyToken::initial(),
            product: None,
        })
    }

    pub fn id(&self) -> BasketItemId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Filled by the `product` include.
    pub fn product(&self) -> Option<&ProductSummary> {
        self.product.as_ref()
    }

    pub fn set_quantity(&mut self, quantity: u32) -> std::result::Result<(), BasketError> {
        if quantity == 0 {
            return Err(BasketError::InvalidQuantity { quantity });
        }
        self.quantity = quantity;
        Ok(())
    }

    pub(crate) fn attach_product(&mut self, product: ProductSummary) {
        self.product = Some(product);
    }
}

impl Entity for BasketItem {
    const TABLE: &'static str = "basket_items";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = BasketItemId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn parent_key(&self) -> Option<EntityKey> {
        Some(self.user_id.key())
    }

    fn auditable(&mut self) -> Option<&mut dyn Auditable> {
        Some(self)
    }
}

impl Auditable for BasketItem {
    fn touch_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn touch_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

/// Service for basket lines and checkout.
pub struct BasketService<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> BasketService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::with_clock(self.store.clone(), self.clock.clone())
    }

    /// Adds units of a product, merging into the existing line. The merged
    /// quantity must be in stock, but no stock is taken.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn add(
        &self,
        user_id: UserId,
        product_id: ProductId,
        quantity: u32,
        cancel: &CancellationToken,
    ) -> Result<BasketItem> {
        if quantity == 0 {
            return Err(BasketError::InvalidQuantity { quantity }.into());
        }

        let mut uow = self.unit_of_work();
        let product = load_product(&mut uow, product_id, cancel).await?;
        let mut lines = uow.repository::<BasketItem>();
        let existing = lines
            .first_or_default(&specifications::basket_line(user_id, product_id), cancel)
            .await?;

        let line = match existing {
            Some(mut line) => {
                let merged = line
                    .quantity()
                    .checked_add(quantity)
                    .ok_or(BasketError::InvalidQuantity { quantity })?;
                ensure_available(&product, merged)?;
                line.set_quantity(merged)?;
                lines.update(&line)?;
                line
            }
            None => {
                ensure_available(&product, quantity)?;
                lines
                    .create(BasketItem::new(user_id, product_id, quantity)?, cancel)
                    .await?
            }
        };
        uow.save_changes(cancel).await?;
        Ok(refreshed(&uow, line))
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn change_quantity(
        &self,
        user_id: UserId,
        product_id: ProductId,
        quantity: u32,
        cancel: &CancellationToken,
    ) -> Result<BasketItem> {
        let mut uow = self.unit_of_work();
        let product = load_product(&mut uow, product_id, cancel).await?;
        let mut lines = uow.repository::<BasketItem>();
        let mut line = lines
            .first_or_default(&specifications::basket_line(user_id, product_id), cancel)
            .await?
            .ok_or(BasketError::ItemNotFound { product_id })?;

        line.set_quantity(quantity)?;
        ensure_available(&product, quantity)?;
        lines.update(&line)?;
        uow.save_changes(cancel).await?;
        Ok(refreshed(&uow, line))
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn remove(
        &self,
        user_id: UserId,
        product_id: ProductId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut uow = self.unit_of_work();
        let mut lines = uow.repository::<BasketItem>();
        let line = lines
            .first_or_default(&specifications::basket_line(user_id, product_id), cancel)
            .await?
            .ok_or(BasketError::ItemNotFound { product_id })?;
        lines.remove(&line)?;
        uow.save_changes(cancel).await?;
        Ok(())
    }

    /// Lists the user's basket with current product data.
    pub async fn items(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<Vec<BasketItem>> {
        let mut uow = self.unit_of_work();
        Ok(uow
            .repository::<BasketItem>()
            .list(&specifications::basket_for_user_with_products(user_id), cancel)
            .await?)
    }

    /// Turns the basket into a pending order.
    ///
    /// The order, the stock it takes and the emptied basket are written in a
    /// single save, so a conflict on any product leaves the basket intact.
    #[tracing::instrument(skip(self, delivery_address, cancel))]
    pub async fn checkout(
        &self,
        user_id: UserId,
        delivery_address: DeliveryAddress,
        cancel: &CancellationToken,
    ) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let lines = uow
            .repository::<BasketItem>()
            .list(&specifications::basket_for_user(user_id), cancel)
            .await?;
        if lines.is_empty() {
            return Err(BasketError::Empty.into());
        }

        let ids = lines.iter().map(|l| l.product_id().key());
        let products: HashMap<ProductId, Product> = uow
            .repository::<Product>()
            .list(&Specification::for_keys(ids).as_no_tracking(), cancel)
            .await?
            .into_iter()
            .map(|p| (p.id(), p))
            .collect();

        let mut order_lines = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = products
                .get(&line.product_id())
                .ok_or_else(|| DomainError::not_found("Product", line.product_id()))?;
            order_lines.push((product, line.quantity()));
        }

        let (order, changes) = Order::place(user_id, delivery_address, &order_lines)?;
        let order = uow.repository::<Order>().create(order, cancel).await?;
        stage_stock_changes(&mut uow, &changes, cancel).await?;
        uow.repository::<BasketItem>().remove_range(&lines)?;
        uow.save_changes(cancel).await?;

        metrics::counter!("orders_placed_total").increment(1);
        info!(%user_id, order_id = %order.id(), lines = lines.len(), "Basket checked out");

        uow.repository::<Order>()
            .first_or_default(
                &specifications::order_by_id_with_items_and_products(order.id()),
                cancel,
            )
            .await?
            .ok_or_else(|| DomainError::not_found("Order", order.id()))
    }
}

async fn load_product<S: Store>(
    uow: &mut UnitOfWork<S>,
    product_id: ProductId,
    cancel: &CancellationToken,
) -> Result<Product> {
    uow.repository::<Product>()
        .first_or_default(&specifications::product_by_id_no_tracking(product_id), cancel)
        .await?
        .ok_or_else(|| DomainError::not_found("Product", product_id))
}

fn ensure_available(product: &Product, quantity: u32) -> std::result::Result<(), ProductError> {
    if product.has_available(i64::from(quantity)) {
        Ok(())
    } else {
        Err(ProductError::StockQuantityNotAvailable {
            available: product.stock_quantity(),
            requested: i64::from(quantity),
        })
    }
}
