//! Named specifications per aggregate.
//!
//! These factories are the only place that knows which relations an
//! operation needs loaded and whether the result is tracked for writing.

use std::collections::HashMap;

use async_trait::async_trait;
use common::{EntityKey, OrderId, PaymentId, ProductId, RoleId, UserId};
use store::{
    Entity, Include, Projection, RowSource, Specification, children_by_parent, rows_by_key,
};

use crate::basket::BasketItem;
use crate::identity::{Role, User, UserRole};
use crate::order::{Order, OrderItem};
use crate::payment::Payment;
use crate::product::{Product, ProductSummary};

// =============================================================================
// Include steps
// =============================================================================

/// Loads the lines of each order.
pub struct OrderItems;

#[async_trait]
impl Include<Order> for OrderItems {
    fn path(&self) -> &'static str {
        "items"
    }

    async fn load(&self, orders: &mut [Order], rows: &mut dyn RowSource) -> store::Result<()> {
        let keys = orders.iter().map(Entity::key).collect();
        let mut grouped = children_by_parent(rows, OrderItem::TABLE, keys).await?;
        for order in orders.iter_mut() {
            let items = grouped
                .remove(&order.key())
                .unwrap_or_default()
                .into_iter()
                .map(|row| {
                    let mut item: OrderItem = row.decode()?;
                    item.set_key(row.key);
                    item.set_token(row.token);
                    Ok(item)
                })
                .collect::<store::Result<_>>()?;
            order.set_items(items);
        }
        Ok(())
    }
}

/// Attaches the current product to each loaded order line.
pub struct OrderItemProducts;

#[async_trait]
impl Include<Order> for OrderItemProducts {
    fn path(&self) -> &'static str {
        "items.product"
    }

    fn depends_on(&self) -> Option<&'static str> {
        Some("items")
    }

    async fn load(&self, orders: &mut [Order], rows: &mut dyn RowSource) -> store::Result<()> {
        let keys = orders
            .iter()
            .flat_map(|o| o.items().iter().map(|i| i.product_id().key()))
            .collect();
        let products = product_summaries(rows, keys).await?;
        for item in orders.iter_mut().flat_map(|o| o.items_mut().iter_mut()) {
            if let Some(product) = products.get(&item.product_id()) {
                item.attach_product(product.clone());
            }
        }
        Ok(())
    }
}

/// Attaches the current product to each basket line.
pub struct BasketItemProducts;

#[async_trait]
impl Include<BasketItem> for BasketItemProducts {
    fn path(&self) -> &'static str {
        "product"
    }

    async fn load(
        &self,
        lines: &mut [BasketItem],
        rows: &mut dyn RowSource,
    ) -> store::Result<()> {
        let keys = lines.iter().map(|l| l.product_id().key()).collect();
        let products = product_summaries(rows, keys).await?;
        for line in lines.iter_mut() {
            if let Some(product) = products.get(&line.product_id()) {
                line.attach_product(product.clone());
            }
        }
        Ok(())
    }
}

/// Loads the role assignments of each user.
pub struct UserRoles;

#[async_trait]
impl Include<User> for UserRoles {
    fn path(&self) -> &'static str {
        "roles"
    }

    async fn load(&self, users: &mut [User], rows: &mut dyn RowSource) -> store::Result<()> {
        let keys = users.iter().map(Entity::key).collect();
        let mut grouped = children_by_parent(rows, UserRole::TABLE, keys).await?;
        for user in users.iter_mut() {
            let roles = grouped
                .remove(&user.key())
                .unwrap_or_default()
                .into_iter()
                .map(|row| {
                    let mut role: UserRole = row.decode()?;
                    role.set_key(row.key);
                    role.set_token(row.token);
                    Ok(role)
                })
                .collect::<store::Result<_>>()?;
            user.set_roles(roles);
        }
        Ok(())
    }
}

async fn product_summaries(
    rows: &mut dyn RowSource,
    keys: Vec<EntityKey>,
) -> store::Result<HashMap<ProductId, ProductSummary>> {
    rows_by_key(rows, Product::TABLE, keys)
        .await?
        .into_values()
        .map(|row| {
            let mut product: Product = row.decode()?;
            product.set_key(row.key);
            Ok((product.id(), ProductSummary::project(&product)))
        })
        .collect()
}

// =============================================================================
// Products
// =============================================================================

/// Product by id, tracked for a stock update.
pub fn product_by_id(product_id: ProductId) -> Specification<Product> {
    Specification::for_key(product_id)
}

pub fn product_by_id_no_tracking(product_id: ProductId) -> Specification<Product> {
    Specification::for_key(product_id).as_no_tracking()
}

/// Products by id, tracked.
pub fn products_by_ids(ids: impl IntoIterator<Item = ProductId>) -> Specification<Product> {
    Specification::for_keys(ids.into_iter().map(|id| id.key()))
}

pub fn all_products() -> Specification<Product> {
    Specification::new().as_no_tracking()
}

// =============================================================================
// Orders
// =============================================================================

/// Order root only. Its lines stay untouched when it is saved.
pub fn order_by_id(order_id: OrderId) -> Specification<Order> {
    Specification::for_key(order_id)
}

/// Order with its lines, tracked for an item or status change.
pub fn order_by_id_with_items(order_id: OrderId) -> Specification<Order> {
    Specification::for_key(order_id).include(OrderItems)
}

/// Read-only order with its lines and their current products.
pub fn order_by_id_with_items_and_products(order_id: OrderId) -> Specification<Order> {
    Specification::for_key(order_id)
        .include(OrderItems)
        .then_include(OrderItemProducts)
        .as_no_tracking()
}

pub fn orders_for_user(user_id: UserId) -> Specification<Order> {
    Specification::matching(move |o: &Order| o.user_id() == user_id).as_no_tracking()
}

/// Order lines of any order that reference the product.
pub fn order_items_for_product(product_id: ProductId) -> Specification<OrderItem> {
    Specification::matching(move |i: &OrderItem| i.product_id() == product_id).as_no_tracking()
}

// =============================================================================
// Payments
// =============================================================================

pub fn payment_by_id(payment_id: PaymentId) -> Specification<Payment> {
    Specification::for_key(payment_id)
}

pub fn payment_by_order(order_id: OrderId) -> Specification<Payment> {
    Specification::matching(move |p: &Payment| p.order_id() == order_id)
}

// =============================================================================
// Baskets
// =============================================================================

/// Basket lines of a user, tracked.
pub fn basket_for_user(user_id: UserId) -> Specification<BasketItem> {
    Specification::matching(move |l: &BasketItem| l.user_id() == user_id)
}

pub fn basket_for_user_with_products(user_id: UserId) -> Specification<BasketItem> {
    basket_for_user(user_id)
        .include(BasketItemProducts)
        .as_no_tracking()
}

/// The user's line for one product, tracked.
pub fn basket_line(user_id: UserId, product_id: ProductId) -> Specification<BasketItem> {
    basket_for_user(user_id).and(move |l| l.product_id() == product_id)
}

pub fn basket_items_for_product(product_id: ProductId) -> Specification<BasketItem> {
    Specification::matching(move |l: &BasketItem| l.product_id() == product_id)
}

// =============================================================================
// Identity
// =============================================================================

pub fn user_by_id_with_roles(user_id: UserId) -> Specification<User> {
    Specification::for_key(user_id)
        .include(UserRoles)
        .as_no_tracking()
}

pub fn role_by_name(name: impl Into<String>) -> Specification<Role> {
    let name = name.into();
    Specification::matching(move |r: &Role| r.name().eq_ignore_ascii_case(&name))
}

/// Role assignments of a user, tracked.
pub fn user_roles_for_user(user_id: UserId) -> Specification<UserRole> {
    Specification::matching(move |r: &UserRole| r.user_id() == user_id)
}

pub fn user_role(user_id: UserId, role_id: RoleId) -> Specification<UserRole> {
    user_roles_for_user(user_id).and(move |r| r.role_id() == role_id)
}

#[cfg(test)]
mod tests {
    use common::Money;

    use super::*;
    use crate::order::DeliveryAddress;

    fn order_for(order_key: EntityKey, user_key: EntityKey) -> Order {
        let mut product = Product::new("Widget", "", Money::from_cents(500), 10).unwrap();
        product.set_key(1);
        let address = DeliveryAddress::new("1 Main St", "Springfield", "12345", "US").unwrap();
        let (mut order, _) =
            Order::place(UserId::new(user_key), address, &[(&product, 1)]).unwrap();
        order.set_key(order_key);
        order
    }

    #[test]
    fn test_and_combines_without_mutating_original() {
        let by_id = order_by_id(OrderId::new(10));
        let by_id_and_user = by_id.and(|o: &Order| o.user_id() == UserId::new(7));

        let mine = order_for(10, 7);
        let theirs = order_for(10, 8);

        assert!(by_id_and_user.is_satisfied_by(10, &mine));
        assert!(!by_id_and_user.is_satisfied_by(10, &theirs));
        assert!(!by_id_and_user.is_satisfied_by(11, &mine));

        // The original still matches on id alone.
        assert!(by_id.is_satisfied_by(10, &theirs));
        assert!(by_id.criteria().is_none());
    }

    #[test]
    fn test_shapes() {
        assert_eq!(
            order_by_id_with_items_and_products(OrderId::new(1)).include_paths(),
            vec!["items", "items.product"]
        );
        assert!(order_by_id_with_items_and_products(OrderId::new(1)).is_no_tracking());
        assert!(!order_by_id_with_items(OrderId::new(1)).is_no_tracking());
        assert!(order_by_id(OrderId::new(1)).includes().is_empty());
        assert!(product_by_id_no_tracking(ProductId::new(1)).is_no_tracking());
        assert_eq!(
            user_by_id_with_roles(UserId::new(1)).include_paths(),
            vec!["roles"]
        );
    }

    #[test]
    fn test_role_by_name_ignores_case() {
        let mut role = Role::new("Admin").unwrap();
        role.set_key(3);
        assert!(role_by_name("admin").is_satisfied_by(3, &role));
        assert!(!role_by_name("editor").is_satisfied_by(3, &role));
    }
}
