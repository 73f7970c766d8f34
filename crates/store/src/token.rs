use serde::{Deserialize, Serialize};

/// Opaque version stamp assigned by the store on every write.
///
/// Callers only compare tokens for equality; the store replaces the token of
/// a row each time it is written, so a writer holding an older token is
/// rejected instead of overwriting a newer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(i64);

impl ConcurrencyToken {
    /// Creates a token from its stored representation.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Token carried by an entity that has never been written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Token assigned to a freshly inserted row.
    pub fn first() -> Self {
        Self(1)
    }

    /// Token that replaces this one on the next write.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the stored representation.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConcurrencyToken {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
