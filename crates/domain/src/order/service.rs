//! Order service providing a simplified API for order operations.

use std::collections::HashMap;
use std::sync::Arc;

use common::{OrderId, ProductId, UserId};
use store::{CancellationToken, Clock, Specification, Store, SystemClock, UnitOfWork};
use tracing::info;

use super::{
    AddOrderItem, Order, OrderError, OrderSummary, PlaceOrder, RemoveOrderItem,
    UpdateOrderItemQuantity,
};
use crate::error::{DomainError, Result};
use crate::refreshed;
use crate::payment::Payment;
use crate::product::{Product, StockChange, stage_stock_changes};
use crate::specifications;

/// Service for managing orders.
///
/// Every operation runs in its own unit of work: load the order in the shape
/// the mutation needs, let the aggregate enforce its rules, then save the
/// order together with any stock movement in one write.
pub struct OrderService<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> OrderService<S> {
    /// Creates a new order service over the given store.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::with_clock(self.store.clone(), self.clock.clone())
    }

    /// Places an order and takes its stock in one write.
    #[tracing::instrument(skip(self, cmd, cancel), fields(user_id = %cmd.user_id))]
    pub async fn place_order(&self, cmd: PlaceOrder, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let ids = cmd.lines.iter().map(|l| l.product_id.key());
        let products: HashMap<ProductId, Product> = uow
            .repository::<Product>()
            .list(&Specification::for_keys(ids).as_no_tracking(), cancel)
            .await?
            .into_iter()
            .map(|p| (p.id(), p))
            .collect();

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            let product = products
                .get(&line.product_id)
                .ok_or_else(|| DomainError::not_found("Product", line.product_id))?;
            lines.push((product, line.quantity));
        }

        let (order, changes) = Order::place(cmd.user_id, cmd.delivery_address, &lines)?;
        let order = uow.repository::<Order>().create(order, cancel).await?;
        stage_stock_changes(&mut uow, &changes, cancel).await?;
        uow.save_changes(cancel).await?;

        metrics::counter!("orders_placed_total").increment(1);
        info!(order_id = %order.id(), total = %order.total_amount(), "Order placed");
        self.get_order(order.id(), cancel).await
    }

    /// Adds an item to a pending order.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn add_item(&self, cmd: AddOrderItem, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let product = uow
            .repository::<Product>()
            .first_or_default(
                &specifications::product_by_id_no_tracking(cmd.product_id),
                cancel,
            )
            .await?
            .ok_or_else(|| DomainError::not_found("Product", cmd.product_id))?;

        self.change_items(
            uow,
            cmd.order_id,
            move |order| order.add_item(&product, cmd.quantity),
            cancel,
        )
        .await
    }

    /// Removes an item from a pending order and returns its stock.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn remove_item(
        &self,
        cmd: RemoveOrderItem,
        cancel: &CancellationToken,
    ) -> Result<Order> {
        self.change_items(
            self.unit_of_work(),
            cmd.order_id,
            move |order| order.remove_item(cmd.product_id),
            cancel,
        )
        .await
    }

    /// Resizes an item of a pending order.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn update_item_quantity(
        &self,
        cmd: UpdateOrderItemQuantity,
        cancel: &CancellationToken,
    ) -> Result<Order> {
        self.change_items(
            self.unit_of_work(),
            cmd.order_id,
            move |order| order.update_item_quantity(cmd.product_id, cmd.new_quantity),
            cancel,
        )
        .await
    }

    /// Confirms a pending order against its succeeded payment.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn confirm(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order = load_order(
            &mut uow,
            &specifications::order_by_id_with_items(order_id),
            order_id,
            cancel,
        )
        .await?;
        let payment = payment_of(&mut uow, &order, cancel).await?;

        order.confirm(payment.as_ref())?;
        save_order(&mut uow, order, cancel).await
    }

    /// Starts processing a placed order.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn process(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order =
            load_order(&mut uow, &specifications::order_by_id(order_id), order_id, cancel).await?;
        order.process()?;
        save_order(&mut uow, order, cancel).await
    }

    /// Ships a placed or processing order with a succeeded payment.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn ship(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order =
            load_order(&mut uow, &specifications::order_by_id(order_id), order_id, cancel).await?;
        let payment = payment_of(&mut uow, &order, cancel).await?;

        order.ship(payment.as_ref())?;
        save_order(&mut uow, order, cancel).await
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn deliver(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order =
            load_order(&mut uow, &specifications::order_by_id(order_id), order_id, cancel).await?;
        order.deliver()?;
        save_order(&mut uow, order, cancel).await
    }

    /// Cancels an order and returns its stock in the same write.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn cancel(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order = load_order(
            &mut uow,
            &specifications::order_by_id_with_items(order_id),
            order_id,
            cancel,
        )
        .await?;

        let returned = order.cancel()?;
        uow.repository::<Order>().update(&order)?;
        stage_stock_changes(&mut uow, &returned, cancel).await?;
        uow.save_changes(cancel).await?;

        metrics::counter!("orders_cancelled_total").increment(1);
        info!(%order_id, "Order cancelled");
        Ok(refreshed(&uow, order))
    }

    /// Refunds whatever is left on the order's payment, marks the order
    /// refunded and returns its stock, all in one write.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn refund(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        let mut order = load_order(
            &mut uow,
            &specifications::order_by_id_with_items(order_id),
            order_id,
            cancel,
        )
        .await?;
        let payment_id = order
            .payment_id()
            .ok_or(OrderError::CannotBeRefundedWithoutPayment)?;

        let mut payments = uow.repository::<Payment>();
        let mut payment = payments
            .first_or_default(&specifications::payment_by_id(payment_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Payment", payment_id))?;
        if !payment.is_fully_refunded() {
            payment.refund(payment.refundable_amount())?;
            payments.update(&payment)?;
        }

        let returned = order.refund(Some(&payment))?;
        uow.repository::<Order>().update(&order)?;
        stage_stock_changes(&mut uow, &returned, cancel).await?;
        uow.save_changes(cancel).await?;

        metrics::counter!("orders_refunded_total").increment(1);
        info!(%order_id, %payment_id, "Order refunded");
        Ok(refreshed(&uow, order))
    }

    /// Loads a read-only order with its items and their current products.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_order(&self, order_id: OrderId, cancel: &CancellationToken) -> Result<Order> {
        let mut uow = self.unit_of_work();
        load_order(
            &mut uow,
            &specifications::order_by_id_with_items_and_products(order_id),
            order_id,
            cancel,
        )
        .await
    }

    pub async fn orders_for_user(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrderSummary>> {
        let mut uow = self.unit_of_work();
        Ok(uow
            .repository::<Order>()
            .list_projected(&specifications::orders_for_user(user_id), cancel)
            .await?)
    }

    async fn change_items(
        &self,
        mut uow: UnitOfWork<S>,
        order_id: OrderId,
        change: impl FnOnce(&mut Order) -> std::result::Result<StockChange, OrderError> + Send,
        cancel: &CancellationToken,
    ) -> Result<Order> {
        let mut order = load_order(
            &mut uow,
            &specifications::order_by_id_with_items(order_id),
            order_id,
            cancel,
        )
        .await?;

        let stock = change(&mut order)?;
        uow.repository::<Order>().update(&order)?;
        stage_stock_changes(&mut uow, &[stock], cancel).await?;
        uow.save_changes(cancel).await?;

        info!(%order_id, total = %order.total_amount(), "Order items changed");
        Ok(refreshed(&uow, order))
    }
}

async fn load_order<S: Store>(
    uow: &mut UnitOfWork<S>,
    spec: &Specification<Order>,
    order_id: OrderId,
    cancel: &CancellationToken,
) -> Result<Order> {
    uow.repository::<Order>()
        .first_or_default(spec, cancel)
        .await?
        .ok_or_else(|| DomainError::not_found("Order", order_id))
}

/// Looks up the order's payment, if one was attached.
async fn payment_of<S: Store>(
    uow: &mut UnitOfWork<S>,
    order: &Order,
    cancel: &CancellationToken,
) -> Result<Option<Payment>> {
    let Some(payment_id) = order.payment_id() else {
        return Ok(None);
    };
    Ok(uow
        .repository::<Payment>()
        .first_or_default(
            &specifications::payment_by_id(payment_id).as_no_tracking(),
            cancel,
        )
        .await?)
}

async fn save_order<S: Store>(
    uow: &mut UnitOfWork<S>,
    order: Order,
    cancel: &CancellationToken,
) -> Result<Order> {
    uow.repository::<Order>().update(&order)?;
    uow.save_changes(cancel).await?;
    info!(order_id = %order.id(), status = %order.status(), "Order status changed");
    Ok(refreshed(uow, order))
}
