//! Order commands.

use common::{OrderId, ProductId, UserId};

use super::DeliveryAddress;

/// One requested line of a new order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Command to place a new order and take its stock.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub delivery_address: DeliveryAddress,
    pub lines: Vec<OrderLine>,
}

impl PlaceOrder {
    pub fn new(user_id: UserId, delivery_address: DeliveryAddress, lines: Vec<OrderLine>) -> Self {
        Self {
            user_id,
            delivery_address,
            lines,
        }
    }
}

/// Command to add an item to a pending order.
#[derive(Debug, Clone, Copy)]
pub struct AddOrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
}

impl AddOrderItem {
    pub fn new(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            order_id,
            product_id,
            quantity,
        }
    }
}

/// Command to remove an item from a pending order.
#[derive(Debug, Clone, Copy)]
pub struct RemoveOrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
}

impl RemoveOrderItem {
    pub fn new(order_id: OrderId, product_id: ProductId) -> Self {
        Self {
            order_id,
            product_id,
        }
    }
}

/// Command to resize an item of a pending order.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOrderItemQuantity {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub new_quantity: u32,
}

impl UpdateOrderItemQuantity {
    pub fn new(order_id: OrderId, product_id: ProductId, new_quantity: u32) -> Self {
        Self {
            order_id,
            product_id,
            new_quantity,
        }
    }
}
