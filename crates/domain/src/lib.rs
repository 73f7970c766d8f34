//! Domain layer for the back office.
//!
//! This crate provides:
//! - Product catalog and the concurrency-checked stock ledger
//! - Order aggregate with its status state machine
//! - Payment aggregate, one per order
//! - Basket and identity services
//! - Named specifications describing how each operation loads its data

pub mod basket;
pub mod error;
pub mod identity;
pub mod order;
pub mod payment;
pub mod product;
pub mod specifications;

pub use basket::{BasketError, BasketItem, BasketService};
pub use error::{DomainError, ErrorKind, Result};
pub use identity::{IdentityError, IdentityService, Role, User, UserRole};
pub use order::{
    AddOrderItem, DeliveryAddress, Order, OrderError, OrderItem, OrderLine, OrderService,
    OrderStatus, OrderSummary, PlaceOrder, RemoveOrderItem, UpdateOrderItemQuantity,
};
pub use payment::{Payment, PaymentError, PaymentMethod, PaymentService, PaymentStatus};
pub use product::{Product, ProductError, ProductSummary, StockChange, StockLedger};

use store::{Entity, Store, UnitOfWork};

/// Copies the token the store assigned on save back onto the entity.
pub(crate) fn refreshed<S: Store, E: Entity>(uow: &UnitOfWork<S>, mut entity: E) -> E {
    if let Some(token) = uow.current_token::<E>(entity.key()) {
        entity.set_token(token);
    }
    entity
}
