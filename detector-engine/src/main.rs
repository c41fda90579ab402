//! Detection Engine worker process.
//!
//! Resolves configuration, opens the database, and hands a fleet of active
//! stations to the [`StationScheduler`]. Runs until interrupted (Ctrl+C),
//! then shuts down its workers gracefully.

use anyhow::{Context, Result};
use detector_common::config::{load_toml_overlay, EngineConfig};
use detector_common::events::EventBus;
use detector_engine::db::init_database_pool_from_url;
use detector_engine::db::stations::list_active_stations;
use detector_engine::resolver::{AcoustIdClient, AuddClient, MetadataDirectoryClient, ResolverClients};
use detector_engine::scheduler::StationScheduler;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EVENT_BUS_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let overlay = load_toml_overlay(None).context("reading config overlay")?;
    let config = EngineConfig::resolve(overlay.as_ref()).context("resolving engine configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), built = env!("BUILD_TIMESTAMP"), "starting detection engine");

    let pool = init_database_pool_from_url(&config.database_url)
        .await
        .context("opening detection engine database")?;

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);

    let clients = ResolverClients {
        acoustid: config.acoustid_api_key.clone().map(AcoustIdClient::new),
        audd: config.audd_api_key.clone().map(AuddClient::new),
        metadata_directory: config.metadata_directory_url.clone().map(MetadataDirectoryClient::new),
    };

    let stations = list_active_stations(&pool).await.context("loading active stations")?;
    info!(count = stations.len(), "loaded active stations");

    let scheduler = StationScheduler::new(pool, config, event_bus, clients);
    scheduler.start(stations).await;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping workers");
    scheduler.stop().await;

    Ok(())
}
