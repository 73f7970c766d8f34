use serde::{Deserialize, Serialize};

/// Raw store key. Keys are assigned by the store; `0` marks an entity that has
/// not been staged yet.
pub type EntityKey = i64;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(EntityKey);

        impl $name {
            /// Creates an identifier from a raw store key.
            pub const fn new(key: EntityKey) -> Self {
                Self(key)
            }

            /// Returns the raw store key.
            pub const fn key(&self) -> EntityKey {
                self.0
            }

            /// Returns true once the store has assigned a key.
            pub const fn is_assigned(&self) -> bool {
                self.0 != 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<EntityKey> for $name {
            fn from(key: EntityKey) -> Self {
                Self(key)
            }
        }

        impl From<$name> for EntityKey {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

entity_id!(
    /// Identifier of a catalog product.
    ProductId
);
entity_id!(
    /// Identifier of an order.
    OrderId
);
entity_id!(
    /// Identifier of a line item owned by an order.
    OrderItemId
);
entity_id!(
    /// Identifier of a payment.
    PaymentId
);
entity_id!(
    /// Identifier of a basket line.
    BasketItemId
);
entity_id!(
    /// Identifier of a user account.
    UserId
);
entity_id!(RoleId);
entity_id!(UserRoleId);
