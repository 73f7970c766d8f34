//! Shared types for the back-office workspace.

pub mod money;
pub mod types;

pub use money::Money;
pub use types::{
    BasketItemId, EntityKey, OrderId, OrderItemId, PaymentId, ProductId, RoleId, UserId,
    UserRoleId,
};
