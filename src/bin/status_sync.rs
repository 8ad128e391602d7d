use anyhow::Result;
use payment_lifecycle::config::AppConfig;
use payment_lifecycle::gateways::selector::GatewaySelector;
use payment_lifecycle::gateways::RetryPolicy;
use payment_lifecycle::repo::pg::PgOrderStore;
use payment_lifecycle::service::reconciler::Reconciler;
use payment_lifecycle::service::status_sync::StatusSync;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await?;

    let store = Arc::new(PgOrderStore { pool });
    let selector = Arc::new(GatewaySelector::from_env(
        &cfg.public_base_url,
        cfg.gateway_timeout_ms,
    )?);

    let worker = StatusSync {
        store: store.clone(),
        selector: selector.clone(),
        reconciler: Reconciler {
            store,
            selector,
            retry: RetryPolicy::default(),
        },
        interval: std::time::Duration::from_secs(cfg.sync_interval_secs),
        grace: chrono::Duration::seconds(cfg.sync_grace_secs),
        batch_size: cfg.sync_batch_size,
    };

    worker.run().await;
    Ok(())
}
