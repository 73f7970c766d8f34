//! Errors surfaced by the back office runner.

use std::path::PathBuf;

use domain::DomainError;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackofficeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Failed to read catalog {}: {source}", path.display())]
    CatalogRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {}: {source}", path.display())]
    CatalogParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, BackofficeError>;
