//! Domain error types.

use common::EntityKey;
use store::StoreError;
use thiserror::Error;

use crate::basket::BasketError;
use crate::identity::IdentityError;
use crate::order::OrderError;
use crate::payment::PaymentError;
use crate::product::ProductError;

/// Broad category of a failure, used by callers to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An id did not resolve to an entity.
    NotFound,

    /// A stale write was rejected; reload and try again.
    Conflict,

    /// Malformed input caught before touching an aggregate.
    Validation,

    /// A state-machine or business-rule rejection.
    InvariantViolation,

    /// Not enough stock or money.
    InsufficientResource,

    /// Store I/O, cancellation or misuse of the data-access layer.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "Validation",
            ErrorKind::InvariantViolation => "InvariantViolation",
            ErrorKind::InsufficientResource => "InsufficientResource",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during domain operations.
///
/// Every variant has a stable numeric [`code`](DomainError::code); each
/// business condition owns exactly one code.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An error occurred in the order aggregate.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Product error: {0}")]
    Product(#[from] ProductError),

    #[error("Basket error: {0}")]
    Basket(#[from] BasketError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Entity not found.
    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: EntityKey },
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl Into<EntityKey>) -> Self {
        DomainError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Store(e) if e.is_conflict() => ErrorKind::Conflict,
            DomainError::Store(_) => ErrorKind::Internal,
            DomainError::Order(e) => e.kind(),
            DomainError::Payment(e) => e.kind(),
            DomainError::Product(e) => e.kind(),
            DomainError::Basket(e) => e.kind(),
            DomainError::Identity(e) => e.kind(),
            DomainError::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            DomainError::NotFound { .. } => 1000,
            DomainError::Store(StoreError::ConcurrencyConflict { .. }) => 1001,
            DomainError::Store(StoreError::Cancelled) => 1002,
            DomainError::Store(_) => 1003,
            DomainError::Product(e) => e.code(),
            DomainError::Order(e) => e.code(),
            DomainError::Payment(e) => e.code(),
            DomainError::Basket(e) => e.code(),
            DomainError::Identity(e) => e.code(),
        }
    }

    /// Returns true if the caller may reload and retry.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
