//! Value objects and owned entities of the order aggregate.

use common::{EntityKey, Money, OrderId, OrderItemId, ProductId};
use serde::{Deserialize, Serialize};
use store::{ConcurrencyToken, Entity};

use super::OrderError;
use crate::product::{Product, ProductSummary};

/// Where an order is shipped. Every part is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    street: String,
    city: String,
    zip: String,
    country: String,
}

impl DeliveryAddress {
    pub fn new(
        street: impl Into<String>,
        city: impl Into<String>,
        zip: impl Into<String>,
        country: impl Into<String>,
    ) -> Result<Self, OrderError> {
        let address = Self {
            street: street.into(),
            city: city.into(),
            zip: zip.into(),
            country: country.into(),
        };

        for (field, value) in [
            ("street", &address.street),
            ("city", &address.city),
            ("zip", &address.zip),
            ("country", &address.country),
        ] {
            if value.trim().is_empty() {
                return Err(OrderError::InvalidAddress { field });
            }
        }
        Ok(address)
    }

    pub fn street(&self) -> &str {
        &self.street
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn zip(&self) -> &str {
        &self.zip
    }

    pub fn country(&self) -> &str {
        &self.country
    }
}

impl std::fmt::Display for DeliveryAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {} {}, {}",
            self.street, self.zip, self.city, self.country
        )
    }
}

/// A line of an order. Only the owning [`Order`](super::Order) creates,
/// resizes or drops lines.
///
/// The unit price is the product price at the moment the line was added and
/// never follows later price changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(skip)]
    id: OrderItemId,
    order_id: OrderId,
    product_id: ProductId,
    product_name: String,
    quantity: u32,
    unit_price: Money,

    #[serde(skip)]
    token: ConcurrencyToken,

    /// Filled by the `items.product` include.
    #[serde(skip)]
    product: Option<ProductSummary>,
}

impl OrderItem {
    pub(crate) fn new(order_id: OrderId, product: &Product, quantity: u32) -> Self {
        Self {
            id: OrderItemId::default(),
            order_id,
            product_id: product.id(),
            product_name: product.name().to_string(),
            quantity,
            unit_price: product.price(),
            token: ConcurrencyToken::initial(),
            product: None,
        }
    }

    pub fn id(&self) -> OrderItemId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn unit_price(&self) -> Money {
        self.unit_price
    }

    /// The current catalog view of the product, when it was included.
    pub fn product(&self) -> Option<&ProductSummary> {
        self.product.as_ref()
    }

    /// Returns the total price for this line (quantity * unit_price).
    pub fn item_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }

    pub fn checked_total(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }

    pub(crate) fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity;
    }

    pub(crate) fn set_order_id(&mut self, order_id: OrderId) {
        self.order_id = order_id;
    }

    pub(crate) fn attach_product(&mut self, product: ProductSummary) {
        self.product = Some(product);
    }
}

impl Entity for OrderItem {
    const TABLE: &'static str = "order_items";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = OrderItemId::new(key);
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn parent_key(&self) -> Option<EntityKey> {
        Some(self.order_id.key())
    }
}
