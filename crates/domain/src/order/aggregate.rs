//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{EntityKey, Money, OrderId, PaymentId, ProductId, UserId};
use serde::{Deserialize, Serialize};
use store::{Auditable, ChildRow, ConcurrencyToken, Entity, OwnedRows, Projection};

use super::{DeliveryAddress, OrderError, OrderItem, OrderStatus};
use crate::payment::Payment;
use crate::product::{Product, StockChange};

/// Order aggregate root.
///
/// Owns its lines and keeps `total_amount` equal to the sum of the line
/// totals. Every mutation returns the stock movement it implies; callers stage
/// those movements in the same unit of work as the order itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    status: OrderStatus,
    delivery_address: DeliveryAddress,
    total_amount: Money,

    /// Sibling payment aggregate, looked up through its own repository.
    payment_id: Option<PaymentId>,

    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    token: ConcurrencyToken,

    #[serde(skip)]
    items: Vec<OrderItem>,

    /// False when the order was loaded without its `items` include.
    #[serde(skip)]
    items_loaded: bool,
}

impl Order {
    /// Builds a pending order with one line per product. Lines for the same
    /// product are merged.
    pub fn place(
        user_id: UserId,
        delivery_address: DeliveryAddress,
        lines: &[(&Product, u32)],
    ) -> Result<(Self, Vec<StockChange>), OrderError> {
        if !user_id.is_assigned() {
            return Err(OrderError::UserIdRequired);
        }
        if lines.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut order = Self {
            id: OrderId::default(),
            user_id,
            status: OrderStatus::Pending,
            delivery_address,
            total_amount: Money::zero(),
            payment_id: None,
            created_at: None,
            updated_at: None,
            token: ConcurrencyToken::initial(),
            items: Vec::with_capacity(lines.len()),
            items_loaded: true,
        };

        let mut changes = Vec::with_capacity(lines.len());
        for (product, quantity) in lines {
            changes.push(order.add_item(product, *quantity)?);
        }
        Ok((order, changes))
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn delivery_address(&self) -> &DeliveryAddress {
        &self.delivery_address
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn items_loaded(&self) -> bool {
        self.items_loaded
    }

    pub fn item(&self, product_id: ProductId) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.product_id() == product_id)
    }

    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity())).sum()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    // =========================================================================
    // Item management
    // =========================================================================

    /// Adds `quantity` units of `product`, merging into an existing line.
    pub fn add_item(&mut self, product: &Product, quantity: u32) -> Result<StockChange, OrderError> {
        self.ensure_items_mutable("add item")?;
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity });
        }

        let (merged, unit_price) = match self.item(product.id()) {
            Some(line) => (line.quantity().checked_add(quantity), line.unit_price()),
            None => (Some(quantity), product.price()),
        };
        let merged = merged.ok_or(OrderError::InvalidQuantity { quantity })?;
        let total = self
            .total_with_line(product.id(), unit_price, merged)
            .ok_or(OrderError::InvalidQuantity { quantity })?;

        let order_id = self.id;
        match self
            .items
            .iter_mut()
            .find(|i| i.product_id() == product.id())
        {
            Some(line) => line.set_quantity(merged),
            None => self.items.push(OrderItem::new(order_id, product, quantity)),
        }
        self.total_amount = total;
        Ok(StockChange::take(product.id(), quantity))
    }

    /// Drops the line for `product_id`. The last line cannot be removed.
    pub fn remove_item(&mut self, product_id: ProductId) -> Result<StockChange, OrderError> {
        self.ensure_items_mutable("remove item")?;
        let position = self.position_of(product_id)?;
        if self.items.len() == 1 {
            return Err(OrderError::CannotRemoveLastItem);
        }

        let removed = self.items.remove(position);
        self.recalculate_total();
        Ok(StockChange::give_back(product_id, removed.quantity()))
    }

    /// Resizes the line for `product_id`.
    pub fn update_item_quantity(
        &mut self,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<StockChange, OrderError> {
        self.ensure_items_mutable("update item quantity")?;
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity });
        }
        let position = self.position_of(product_id)?;
        let total = self
            .total_with_line(product_id, self.items[position].unit_price(), quantity)
            .ok_or(OrderError::InvalidQuantity { quantity })?;

        let line = &mut self.items[position];
        let previous = line.quantity();
        line.set_quantity(quantity);
        self.total_amount = total;
        Ok(StockChange {
            product_id,
            delta: i64::from(previous) - i64::from(quantity),
        })
    }

    // =========================================================================
    // Status transitions
    // =========================================================================

    /// Pending -> Placed, once a succeeded payment covers the order.
    pub fn confirm(&mut self, payment: Option<&Payment>) -> Result<(), OrderError> {
        self.ensure_not_cancelled()?;
        if !self.status.can_confirm() {
            return Err(OrderError::AlreadyConfirmed);
        }
        self.ensure_items_loaded()?;
        if self.items.is_empty() {
            return Err(OrderError::CannotConfirmEmptyOrder);
        }
        if !self.is_paid_by(payment) {
            return Err(OrderError::CannotBeConfirmedWithoutPayment);
        }

        self.status = OrderStatus::Placed;
        Ok(())
    }

    /// Placed -> Processing.
    pub fn process(&mut self) -> Result<(), OrderError> {
        self.transition("process", OrderStatus::can_process, OrderStatus::Processing)
    }

    /// Placed | Processing -> Shipped, only with a succeeded payment.
    pub fn ship(&mut self, payment: Option<&Payment>) -> Result<(), OrderError> {
        self.ensure_not_cancelled()?;
        if !self.status.can_ship() {
            return Err(self.invalid_status("ship"));
        }
        if !self.is_paid_by(payment) {
            return Err(OrderError::CannotBeShippedWithoutPayment);
        }

        self.status = OrderStatus::Shipped;
        Ok(())
    }

    /// Shipped -> Delivered.
    pub fn deliver(&mut self) -> Result<(), OrderError> {
        self.transition("deliver", OrderStatus::can_deliver, OrderStatus::Delivered)
    }

    /// Cancels the order and returns the stock its lines held.
    pub fn cancel(&mut self) -> Result<Vec<StockChange>, OrderError> {
        match self.status {
            OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
            OrderStatus::Refunded => return Err(OrderError::CannotChangeStatusOfACancelledOrder),
            OrderStatus::Shipped | OrderStatus::Delivered => {
                return Err(OrderError::CannotCancelShippedOrDelivered);
            }
            OrderStatus::Pending | OrderStatus::Placed | OrderStatus::Processing => {}
        }
        self.ensure_items_loaded()?;

        self.status = OrderStatus::Cancelled;
        Ok(self.returned_stock())
    }

    /// Marks the order refunded once its payment has been fully refunded,
    /// and returns the stock its lines held.
    pub fn refund(&mut self, payment: Option<&Payment>) -> Result<Vec<StockChange>, OrderError> {
        self.ensure_not_cancelled()?;
        if !self.status.can_cancel() {
            return Err(self.invalid_status("refund"));
        }
        let refunded = payment.is_some_and(|p| p.order_id() == self.id && p.is_fully_refunded());
        if !refunded {
            return Err(OrderError::CannotBeRefundedWithoutPayment);
        }
        self.ensure_items_loaded()?;

        self.status = OrderStatus::Refunded;
        Ok(self.returned_stock())
    }

    /// Records the payment created for this order. Lines are frozen from
    /// here on, since the payment amount was fixed from the current total.
    pub fn attach_payment(&mut self, payment_id: PaymentId) -> Result<(), OrderError> {
        self.ensure_not_cancelled()?;
        if !self.status.can_modify_items() {
            return Err(self.invalid_status("attach payment"));
        }
        self.payment_id = Some(payment_id);
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn set_items(&mut self, items: Vec<OrderItem>) {
        self.items = items;
        self.items_loaded = true;
    }

    pub(crate) fn items_mut(&mut self) -> &mut [OrderItem] {
        &mut self.items
    }

    /// Order total if the line for `product_id` held `quantity` units, or
    /// `None` when it does not fit in [`Money`].
    fn total_with_line(
        &self,
        product_id: ProductId,
        unit_price: Money,
        quantity: u32,
    ) -> Option<Money> {
        let line_total = unit_price.checked_multiply(quantity)?;
        self.items
            .iter()
            .filter(|i| i.product_id() != product_id)
            .try_fold(line_total, |total, item| total.checked_add(item.checked_total()?))
    }

    fn recalculate_total(&mut self) {
        self.total_amount = self.items.iter().map(OrderItem::item_total).sum();
    }

    fn returned_stock(&self) -> Vec<StockChange> {
        self.items
            .iter()
            .map(|i| StockChange::give_back(i.product_id(), i.quantity()))
            .collect()
    }

    fn is_paid_by(&self, payment: Option<&Payment>) -> bool {
        payment.is_some_and(|p| p.order_id() == self.id && p.is_succeeded())
    }

    fn position_of(&self, product_id: ProductId) -> Result<usize, OrderError> {
        self.items
            .iter()
            .position(|i| i.product_id() == product_id)
            .ok_or(OrderError::ItemNotFound { product_id })
    }

    fn transition(
        &mut self,
        operation: &'static str,
        allowed: fn(&OrderStatus) -> bool,
        next: OrderStatus,
    ) -> Result<(), OrderError> {
        self.ensure_not_cancelled()?;
        if !allowed(&self.status) {
            return Err(self.invalid_status(operation));
        }
        self.status = next;
        Ok(())
    }

    fn ensure_items_mutable(&self, operation: &'static str) -> Result<(), OrderError> {
        self.ensure_not_cancelled()?;
        if !self.status.can_modify_items() {
            return Err(self.invalid_status(operation));
        }
        if self.payment_id.is_some() {
            return Err(OrderError::ItemsLocked);
        }
        self.ensure_items_loaded()
    }

    fn ensure_items_loaded(&self) -> Result<(), OrderError> {
        if self.items_loaded {
            Ok(())
        } else {
            Err(OrderError::ItemsNotLoaded)
        }
    }

    fn ensure_not_cancelled(&self) -> Result<(), OrderError> {
        if self.status.is_cancelled() {
            Err(OrderError::CannotChangeStatusOfACancelledOrder)
        } else {
            Ok(())
        }
    }

    fn invalid_status(&self, operation: &'static str) -> OrderError {
        OrderError::InvalidStatusForOperation {
            operation,
            status: self.status,
        }
    }
}

impl Entity for Order {
    const TABLE: &'static str = "orders";
    const OWNED_TABLES: &'static [&'static str] = &[OrderItem::TABLE];

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = OrderId::new(key);
        for item in &mut self.items {
            item.set_order_id(self.id);
        }
    }

    fn token(&self) -> ConcurrencyToken {
        self.token
    }

    fn set_token(&mut self, token: ConcurrencyToken) {
        self.token = token;
    }

    fn unkeyed_children(&self) -> usize {
        if !self.items_loaded {
            return 0;
        }
        self.items.iter().filter(|i| !i.id().is_assigned()).count()
    }

    fn owned_rows(
        &mut self,
        keys: &mut dyn Iterator<Item = EntityKey>,
    ) -> Result<Vec<OwnedRows>, serde_json::Error> {
        if !self.items_loaded {
            return Ok(Vec::new());
        }

        let order_id = self.id;
        let mut rows = Vec::with_capacity(self.items.len());
        for item in &mut self.items {
            if !item.id().is_assigned()
                && let Some(key) = keys.next()
            {
                item.set_key(key);
            }
            item.set_order_id(order_id);
            rows.push(ChildRow {
                key: item.key(),
                body: serde_json::to_value(&*item)?,
            });
        }
        Ok(vec![OwnedRows {
            table: OrderItem::TABLE,
            rows,
        }])
    }

    fn auditable(&mut self) -> Option<&mut dyn Auditable> {
        Some(self)
    }
}

impl Auditable for Order {
    fn touch_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn touch_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}

/// Order list entry, projected without the lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub status: OrderStatus,
    pub total_amount: Money,
    pub has_payment: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl Projection<Order> for OrderSummary {
    fn project(order: &Order) -> Self {
        Self {
            id: order.id,
            status: order.status,
            total_amount: order.total_amount,
            has_payment: order.payment_id.is_some(),
            created_at: order.created_at,
        }
    }
}
