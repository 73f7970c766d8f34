use chrono::{DateTime, Utc};
use common::{EntityKey, Money, ProductId};
use serde::{Deserialize, Serialize};
use store::{Auditable, ConcurrencyToken, Entity, Projection};

use super::ProductError;

/// A catalog product and its stock level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    description: String,
    price: Money,
    stock_quantity: i64,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    token: ConcurrencyToken,
}

impl Product {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        price: Money,
        stock_quantity: i64,
    ) -> Result<Self, ProductError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ProductError::NameRequired);
        }
        if !price.is_positive() {
            return Err(ProductError::PriceNotPositive);
        }
        if stock_quantity < 0 {
            return Err(ProductError::StockQuantityNegative);
        }

        Ok(Self {
            id: ProductId::default(),
            name,
            description: description.into(),
            price,
            stock_quantity,
            created_at: None,
            updated_at: None,
            token: ConcurrencyToken::initial(),
        })
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn price(&self) -> Money {
        self.price
    }

    pub fn stock_quantity(&self) -> i64 {
        self.stock_quantity
    }

    pub fn concurrency_token(&self) -> ConcurrencyToken {
        self.token
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Returns true if `quantity` units can be taken from stock.
    pub fn has_available(&self, quantity: i64) -> bool {
        quantity <= self.stock_quantity
    }

    /// Applies a signed stock delta. Stock never goes below zero.
    pub fn adjust_stock(&mut self, delta: i64) -> Result<(), ProductError> {
        match self.stock_quantity.checked_add(delta) {
            Some(next) if next >= 0 => {
                self.stock_quantity = next;
                Ok(())
            }
            Some(_) => Err(ProductError::StockQuantityNotAvailable {
                available: self.stock_quantity,
                requested: delta.saturating_neg(),
            }),
            None => Err(ProductError::StockQuantityOutOfRange {
                available: self.stock_quantity,
                delta,
            }),
        }
    }
}

impl Entity for Product {
    const TABLE: &'static str = "products";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = ProductId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn auditable(&mut self) -> Option<&mut dyn Auditable> {
        Some(self)
    }
}

impl Auditable for Product {
    fn touch_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn touch_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

/// Read-only view of a product, attached to order and basket lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSummary {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub stock_quantity: i64,
}

impl Projection<Product> for ProductSummary {
    fn project(product: &Product) -> Self {
        Self {
            id: product.id,
            name: product.name.clone(),
            price: product.price,
            stock_quantity: product.stock_quantity,
        }
    }
}

/// A stock movement requested by an order or basket mutation.
/// Negative deltas take stock, positive deltas return it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockChange {
    pub product_id: ProductId,
    pub delta: i64,
}

impl StockChange {
    pub fn take(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            delta: -i64::from(quantity),
        }
    }

    pub fn give_back(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            delta: i64::from(quantity),
        }
    }
}
