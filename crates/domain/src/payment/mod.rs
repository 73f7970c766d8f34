//! Payment aggregate, one per order.

mod aggregate;
mod service;

pub use aggregate::{Payment, PaymentMethod, PaymentStatus};
pub use service::PaymentService;

use common::Money;
use thiserror::Error;

use crate::ErrorKind;

/// Errors that can occur during payment operations.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("A payment already exists for this order")]
    AlreadyExistsForOrder,

    /// Only pending payments can be completed or failed.
    #[error("Payment was already processed")]
    AlreadyProcessed,

    #[error("Insufficient funds: {paid} paid, {to_pay} to pay")]
    InsufficientFunds { to_pay: Money, paid: Money },

    #[error("Invalid payment amount: {amount}")]
    InvalidAmount { amount: Money },

    #[error("Payment in status {status} cannot be refunded")]
    NotRefundable { status: PaymentStatus },

    #[error("Refund of {requested} exceeds the refundable {refundable}")]
    RefundExceedsPayment { requested: Money, refundable: Money },
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::AlreadyExistsForOrder
            | PaymentError::AlreadyProcessed
            | PaymentError::NotRefundable { .. } => ErrorKind::InvariantViolation,
            PaymentError::InsufficientFunds { .. } | PaymentError::RefundExceedsPayment { .. } => {
                ErrorKind::InsufficientResource
            }
            PaymentError::InvalidAmount { .. } => ErrorKind::Validation,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            PaymentError::AlreadyExistsForOrder => 4001,
            PaymentError::AlreadyProcessed => 4002,
            PaymentError::InsufficientFunds { .. } => 4003,
            PaymentError::InvalidAmount { .. } => 4004,
            PaymentError::NotRefundable { .. } => 4005,
            PaymentError::RefundExceedsPayment { .. } => 4006,
        }
    }
}
