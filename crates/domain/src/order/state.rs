//! Order state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Placed ──► Processing ──► Shipped ──► Delivered
///    │          │            │
///    └──────────┴────────────┴──► Cancelled | Refunded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Items can be added, removed or resized.
    #[default]
    Pending,

    /// Confirmed against a succeeded payment.
    Placed,

    Processing,

    Shipped,

    /// Terminal.
    Delivered,

    /// Terminal.
    Cancelled,

    /// Terminal.
    Refunded,
}

impl OrderStatus {
    /// Returns true if items can be modified in this status.
    pub fn can_modify_items(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    pub fn can_confirm(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    pub fn can_process(&self) -> bool {
        matches!(self, OrderStatus::Placed)
    }

    pub fn can_ship(&self) -> bool {
        matches!(self, OrderStatus::Placed | OrderStatus::Processing)
    }

    pub fn can_deliver(&self) -> bool {
        matches!(self, OrderStatus::Shipped)
    }

    /// Returns true if the order can be cancelled or refunded in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Placed | OrderStatus::Processing
        )
    }

    /// Returns true if the order was cancelled or refunded.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// Returns true if goods have left the warehouse.
    pub fn is_shipped(&self) -> bool {
        matches!(self, OrderStatus::Shipped | OrderStatus::Delivered)
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Placed => "Placed",
            OrderStatus::Processing => "Processing",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Refunded => "Refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
