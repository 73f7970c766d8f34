use chrono::{DateTime, Utc};
use common::{EntityKey, Money, OrderId, PaymentId};
use serde::{Deserialize, Serialize};
use store::{Auditable, ConcurrencyToken, Entity};

use super::PaymentError;
use crate::order::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    CreditCard,
    BankTransfer,
}

impl PaymentMethod {
    /// Cash payments hand back change when overpaid.
    pub fn gives_change(&self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

/// The status of a payment.
///
/// ```text
/// Pending ──► Succeeded ──► PartiallyRefunded ──► Refunded
///    │            └─────────────────────────────────┘
///    └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PaymentStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Succeeded => "Succeeded",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
            PaymentStatus::PartiallyRefunded => "PartiallyRefunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment aggregate. The amount to pay is fixed from the order total when
/// the payment is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    id: PaymentId,
    order_id: OrderId,
    amount_to_pay: Money,
    amount_paid: Option<Money>,
    cash_change: Option<Money>,
    refunded_amount: Money,
    method: PaymentMethod,
    status: PaymentStatus,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    token: ConcurrencyToken,
}

impl Payment {
    /// Creates a pending payment for the order's current total.
    pub fn for_order(order: &Order, method: PaymentMethod) -> Result<Self, PaymentError> {
        let amount_to_pay = order.total_amount();
        if !amount_to_pay.is_positive() {
            return Err(PaymentError::InvalidAmount {
                amount: amount_to_pay,
            });
        }

        Ok(Self {
            id: PaymentId::default(),
            order_id: order.id(),
            amount_to_pay,
            amount_paid: None,
            cash_change: None,
            refunded_amount: Money::zero(),
            method,
            status: PaymentStatus::Pending,
            created_at: None,
            updated_at: None,
            token: ConcurrencyToken::initial(),
        })
    }

    pub fn id(&self) -> PaymentId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn amount_to_pay(&self) -> Money {
        self.amount_to_pay
    }

    pub fn amount_paid(&self) -> Option<Money> {
        self.amount_paid
    }

    pub fn cash_change(&self) -> Option<Money> {
        self.cash_change
    }

    pub fn refunded_amount(&self) -> Money {
        self.refunded_amount
    }

    pub fn method(&self) -> PaymentMethod {
        self.method
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }

    pub fn is_fully_refunded(&self) -> bool {
        self.status == PaymentStatus::Refunded
    }

    /// What can still be refunded.
    pub fn refundable_amount(&self) -> Money {
        match self.status {
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded => {
                self.amount_to_pay - self.refunded_amount
            }
            _ => Money::zero(),
        }
    }

    /// Pending -> Succeeded once `amount_paid` covers the amount to pay.
    pub fn complete(&mut self, amount_paid: Money) -> Result<(), PaymentError> {
        if self.status != PaymentStatus::Pending {
            return Err(PaymentError::AlreadyProcessed);
        }
        if amount_paid < self.amount_to_pay {
            return Err(PaymentError::InsufficientFunds {
                to_pay: self.amount_to_pay,
                paid: amount_paid,
            });
        }

        self.amount_paid = Some(amount_paid);
        self.cash_change = self
            .method
            .gives_change()
            .then(|| amount_paid - self.amount_to_pay);
        self.status = PaymentStatus::Succeeded;
        Ok(())
    }

    /// Pending -> Failed.
    pub fn fail(&mut self) -> Result<(), PaymentError> {
        if self.status != PaymentStatus::Pending {
            return Err(PaymentError::AlreadyProcessed);
        }
        self.status = PaymentStatus::Failed;
        Ok(())
    }

    /// Refunds part or all of what was paid. Refunds accumulate; the
    /// payment is `Refunded` once the whole amount was given back.
    pub fn refund(&mut self, amount: Money) -> Result<(), PaymentError> {
        if !matches!(
            self.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        ) {
            return Err(PaymentError::NotRefundable {
                status: self.status,
            });
        }
        if !amount.is_positive() {
            return Err(PaymentError::InvalidAmount { amount });
        }
        let refundable = self.refundable_amount();
        if amount > refundable {
            return Err(PaymentError::RefundExceedsPayment {
                requested: amount,
                refundable,
            });
        }

        self.refunded_amount += amount;
        self.status = if self.refunded_amount == self.amount_to_pay {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        Ok(())
    }
}

impl Entity for Payment {
    const TABLE: &'static str = "payments";

    fn key(&self) -> EntityKey {
        self.id.key()
    }

    fn set_key(&mut self, key: EntityKey) {
        self.id = PaymentId::new(key);
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

impl Auditable for Payment {
    fn touch_created(&mut self, at: DateTime<Utc>) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn touch_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }
}
