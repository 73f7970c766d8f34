use std::sync::Arc;

use common::{Money, OrderId, PaymentId};
use store::{CancellationToken, Clock, Store, SystemClock, UnitOfWork};
use tracing::info;

use super::{Payment, PaymentError, PaymentMethod};
use crate::error::{DomainError, Result};
use crate::order::Order;
use crate::refreshed;
use crate::specifications;

/// Service for creating and settling payments.
pub struct PaymentService<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> PaymentService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::with_clock(self.store.clone(), self.clock.clone())
    }

    /// Creates the payment of an order for its current total.
    ///
    /// The order is updated in the same write to point at the payment, so
    /// two concurrent creations for one order cannot both commit: the
    /// second fails on the order's concurrency token.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn create_for_order(
        &self,
        order_id: OrderId,
        method: PaymentMethod,
        cancel: &CancellationToken,
    ) -> Result<Payment> {
        let mut uow = self.unit_of_work();
        let mut order = uow
            .repository::<Order>()
            .first_or_default(&specifications::order_by_id(order_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Order", order_id))?;

        let exists = uow
            .repository::<Payment>()
            .any(&specifications::payment_by_order(order_id), cancel)
            .await?;
        if exists || order.payment_id().is_some() {
            return Err(PaymentError::AlreadyExistsForOrder.into());
        }

        let payment = Payment::for_order(&order, method)?;
        let payment = uow.repository::<Payment>().create(payment, cancel).await?;
        order.attach_payment(payment.id())?;
        uow.repository::<Order>().update(&order)?;
        uow.save_changes(cancel).await?;

        metrics::counter!("payments_created_total").increment(1);
        info!(payment_id = %payment.id(), amount = %payment.amount_to_pay(), "Payment created");
        Ok(refreshed(&uow, payment))
    }

    /// Settles a pending payment with the amount received.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn complete(
        &self,
        payment_id: PaymentId,
        amount_paid: Money,
        cancel: &CancellationToken,
    ) -> Result<Payment> {
        self.change(payment_id, cancel, |payment| payment.complete(amount_paid))
            .await
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn fail(&self, payment_id: PaymentId, cancel: &CancellationToken) -> Result<Payment> {
        self.change(payment_id, cancel, Payment::fail).await
    }

    /// Refunds part of a settled payment without touching the order.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn refund(
        &self,
        payment_id: PaymentId,
        amount: Money,
        cancel: &CancellationToken,
    ) -> Result<Payment> {
        self.change(payment_id, cancel, |payment| payment.refund(amount))
            .await
    }

    pub async fn get(&self, payment_id: PaymentId, cancel: &CancellationToken) -> Result<Payment> {
        let mut uow = self.unit_of_work();
        uow.repository::<Payment>()
            .first_or_default(
                &specifications::payment_by_id(payment_id).as_no_tracking(),
                cancel,
            )
            .await?
            .ok_or_else(|| DomainError::not_found("Payment", payment_id))
    }

    pub async fn for_order(
        &self,
        order_id: OrderId,
        cancel: &CancellationToken,
    ) -> Result<Option<Payment>> {
        let mut uow = self.unit_of_work();
        Ok(uow
            .repository::<Payment>()
            .first_or_default(
                &specifications::payment_by_order(order_id).as_no_tracking(),
                cancel,
            )
            .await?)
    }

    async fn change(
        &self,
        payment_id: PaymentId,
        cancel: &CancellationToken,
        apply: impl FnOnce(&mut Payment) -> std::result::Result<(), PaymentError> + Send,
    ) -> Result<Payment> {
        let mut uow = self.unit_of_work();
        let mut payments = uow.repository::<Payment>();
        let mut payment = payments
            .first_or_default(&specifications::payment_by_id(payment_id), cancel)
            .await?
            .ok_or_else(|| DomainError::not_found("Payment", payment_id))?;

        apply(&mut payment)?;
        payments.update(&payment)?;
        uow.save_changes(cancel).await?;

        info!(%payment_id, status = %payment.status(), "Payment updated");
        Ok(refreshed(&uow, payment))
    }
}
