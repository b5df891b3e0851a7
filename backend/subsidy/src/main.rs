//! Green-hydrogen subsidy service: entry point.
//!
//! Tracks producer → project → milestone → payment and pays a per-kilogram
//! subsidy for each verified milestone exactly once. State lives in SQLite;
//! a small Axum REST API exposes registration, the milestone lifecycle,
//! disbursement and supporting-document uploads.

mod accounts;
mod api;
mod config;
mod db;
mod disbursement;
mod documents;
mod errors;
mod lifecycle;
mod models;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use disbursement::DisbursementEngine;
use documents::DocumentStore;
use lifecycle::MilestoneLifecycle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(
        &config.database_url,
        config.max_connections,
        Duration::from_secs(config.busy_timeout_secs),
    )
    .await?;

    info!("Subsidy rate: {} per kg", config.subsidy_rate);

    let documents = DocumentStore::new(config.upload_dir.clone(), config.max_upload_bytes);
    documents.ensure_dir().await?;
    info!("Storing uploaded documents in {}", config.upload_dir.display());

    let api_state = Arc::new(api::ApiState {
        lifecycle: MilestoneLifecycle::new(pool.clone()),
        engine: DisbursementEngine::new(pool.clone(), config.subsidy_rate),
        default_estimated_production: config.default_estimated_production,
        documents,
        pool,
    });

    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
