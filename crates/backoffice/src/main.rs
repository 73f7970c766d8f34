//! Back office entry point.

use backoffice::config::Config;
use backoffice::error::Result;
use store::{CancellationToken, InMemoryStore, PostgresStore};
use tokio::signal;

/// Cancels in-flight store calls on SIGINT.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, cancelling");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    backoffice::init_tracing(&config);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    // 2. Prepare the store and seed the catalog
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.max_connections).await?;
            store.run_migrations().await?;
            tracing::info!(max_connections = config.max_connections, "migrations applied");
            backoffice::run(store, &config, &cancel).await?;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            backoffice::run(InMemoryStore::new(), &config, &cancel).await?;
        }
    }

    Ok(())
}
