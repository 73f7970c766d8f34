//! Back office runner for the order management domain.
//!
//! Loads configuration, installs structured logging, prepares the store and
//! seeds the product catalog.

pub mod config;
pub mod error;
pub mod seed;

use store::{CancellationToken, Store};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{Config, LogFormat};
use domain::StockLedger;
use error::Result;

/// Installs the global tracing subscriber.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Catalog state after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogReport {
    pub seeded: usize,
    pub products: usize,
    pub units_in_stock: i64,
}

/// Seeds the catalog if configured and reports what the store holds.
pub async fn run<S: Store>(
    store: S,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<CatalogReport> {
    let ledger = StockLedger::new(store);

    let seeded = match &config.seed_products {
        Some(path) => {
            let entries = seed::load_catalog(path).await?;
            seed::seed_catalog(&ledger, &entries, cancel).await?
        }
        None => 0,
    };

    let products = ledger.list_products(cancel).await?;
    let report = CatalogReport {
        seeded,
        products: products.len(),
        units_in_stock: products.iter().map(|p| p.stock_quantity).sum(),
    };
    info!(
        seeded = report.seeded,
        products = report.products,
        units_in_stock = report.units_in_stock,
        "Back office ready"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use store::InMemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_run_without_catalog() {
        let report = run(InMemoryStore::new(), &Config::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report,
            CatalogReport {
                seeded: 0,
                products: 0,
                units_in_stock: 0
            }
        );
    }

    #[tokio::test]
    async fn test_run_seeds_from_file() {
        let path = std::env::temp_dir()
            .join(format!("backoffice-catalog-{}.json", std::process::id()));
        tokio::fs::write(
            &path,
            r#"[{"name": "Widget", "price_cents": 1999, "stock": 25},
                {"name": "Gadget", "price_cents": 500, "stock": 5}]"#,
        )
        .await
        .unwrap();
        let config = Config {
            seed_products: Some(path.clone()),
            ..Config::default()
        };

        let report = run(InMemoryStore::new(), &config, &CancellationToken::new())
            .await
            .unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(report.seeded, 2);
        assert_eq!(report.products, 2);
        assert_eq!(report.units_in_stock, 30);
    }
}
