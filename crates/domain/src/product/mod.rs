//! Product catalog and stock ledger.

mod entity;
mod ledger;

pub use entity::{Product, ProductSummary, StockChange};
pub use ledger::StockLedger;
pub(crate) use ledger::stage_stock_changes;

use thiserror::Error;

use crate::ErrorKind;

/// Errors that can occur during product operations.
#[derive(Debug, Error)]
pub enum ProductError {
    #[error("Product name is required")]
    NameRequired,

    #[error("Product price must be greater than 0")]
    PriceNotPositive,

    #[error("Stock quantity cannot be negative")]
    StockQuantityNegative,

    /// Applying the delta would take stock below zero.
    #[error("Stock quantity not available: {available} in stock, {requested} requested")]
    StockQuantityNotAvailable { available: i64, requested: i64 },

    /// Applying the delta would overflow the stock counter.
    #[error("Stock quantity out of range: {available} in stock, delta {delta}")]
    StockQuantityOutOfRange { available: i64, delta: i64 },

    /// The product is still referenced by order items.
    #[error("Product is referenced by existing orders")]
    InUse,
}

impl ProductError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProductError::NameRequired
            | ProductError::PriceNotPositive
            | ProductError::StockQuantityNegative
            | ProductError::StockQuantityOutOfRange { .. } => ErrorKind::Validation,
            ProductError::StockQuantityNotAvailable { .. } => ErrorKind::InsufficientResource,
            ProductError::InUse => ErrorKind::InvariantViolation,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            ProductError::NameRequired => 2001,
            ProductError::PriceNotPositive => 2002,
            ProductError::StockQuantityNegative => 2003,
            ProductError::StockQuantityNotAvailable { .. } => 2004,
            ProductError::InUse => 2005,
            ProductError::StockQuantityOutOfRange { .. } => 2006,
        }
    }
}
