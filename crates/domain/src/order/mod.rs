//! Order aggregate and related types.

mod aggregate;
mod commands;
mod service;
mod state;
mod value_objects;

pub use aggregate::{Order, OrderSummary};
pub use commands::*;
pub use service::OrderService;
pub use state::OrderStatus;
pub use value_objects::{DeliveryAddress, OrderItem};

use common::ProductId;
use thiserror::Error;

use crate::ErrorKind;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order is already confirmed")]
    AlreadyConfirmed,

    #[error("Cannot confirm an order without items")]
    CannotConfirmEmptyOrder,

    #[error("Order cannot be confirmed without a succeeded payment")]
    CannotBeConfirmedWithoutPayment,

    #[error("Order cannot be shipped without a succeeded payment")]
    CannotBeShippedWithoutPayment,

    #[error("Order is already cancelled")]
    AlreadyCancelled,

    #[error("Cannot change the status of a cancelled or refunded order")]
    CannotChangeStatusOfACancelledOrder,

    #[error("Cannot cancel an order that was shipped or delivered")]
    CannotCancelShippedOrDelivered,

    #[error("Cannot remove the last item of an order")]
    CannotRemoveLastItem,

    /// The transition is not defined for the current status.
    #[error("Invalid status for this operation: cannot {operation} from {status}")]
    InvalidStatusForOperation {
        operation: &'static str,
        status: OrderStatus,
    },

    /// A payment was created from the current total; lines are frozen.
    #[error("Order items cannot change once a payment exists")]
    ItemsLocked,

    #[error("Item not found: product {product_id}")]
    ItemNotFound { product_id: ProductId },

    #[error("Invalid quantity: {quantity} (must be positive and keep the line within range)")]
    InvalidQuantity { quantity: u32 },

    #[error("Delivery address {field} is required")]
    InvalidAddress { field: &'static str },

    #[error("Order has no items")]
    NoItems,

    #[error("Order can only be refunded after its payment was refunded")]
    CannotBeRefundedWithoutPayment,

    /// The order was loaded without its items and then asked to change them.
    #[error("Order items were not loaded")]
    ItemsNotLoaded,

    #[error("User ID is required")]
    UserIdRequired,
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidQuantity { .. }
            | OrderError::InvalidAddress { .. }
            | OrderError::NoItems
            | OrderError::UserIdRequired => ErrorKind::Validation,
            OrderError::ItemNotFound { .. } => ErrorKind::NotFound,
            OrderError::ItemsNotLoaded => ErrorKind::Internal,
            _ => ErrorKind::InvariantViolation,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            OrderError::AlreadyConfirmed => 3001,
            OrderError::CannotConfirmEmptyOrder => 3002,
            OrderError::CannotBeConfirmedWithoutPayment => 3003,
            OrderError::CannotBeShippedWithoutPayment => 3004,
            OrderError::AlreadyCancelled => 3005,
            OrderError::CannotChangeStatusOfACancelledOrder => 3006,
            OrderError::CannotCancelShippedOrDelivered => 3007,
            OrderError::CannotRemoveLastItem => 3008,
            OrderError::InvalidStatusForOperation { .. } => 3009,
            OrderError::ItemsLocked => 3010,
            OrderError::ItemNotFound { .. } => 3011,
            OrderError::InvalidQuantity { .. } => 3012,
            OrderError::InvalidAddress { .. } => 3013,
            OrderError::NoItems => 3014,
            OrderError::CannotBeRefundedWithoutPayment => 3015,
            OrderError::ItemsNotLoaded => 3016,
            OrderError::UserIdRequired => 3017,
        }
    }
}
