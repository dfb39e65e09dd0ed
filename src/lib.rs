//! Process glue for the NTRIP relay binary: wires one `Repository`, one
//! `CasterServer`, and one `RelaySupervisor` together and runs them
//! until shutdown.

pub mod api;
pub mod config;

use std::sync::Arc;

use config::Config;
use log::info;
use relay::{CasterConfig, CasterServer, InMemoryRepository, RelaySupervisor};

/// Opened so integration tests and the binary share one entry point.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let repository = Arc::new(InMemoryRepository::new());

    let caster_config = CasterConfig {
        bind_host: config.caster.host.to_string(),
        bind_port: config.caster.port,
        operator: config.caster.operator.clone(),
        country: config.caster.country.clone(),
        centroid_lat: config.caster.centroid_lat,
        centroid_lon: config.caster.centroid_lon,
        network: config.caster.network.clone(),
    };
    let caster = CasterServer::new(caster_config, repository.clone());
    let supervisor = Arc::new(RelaySupervisor::new(repository, caster.clone(), config.source.keepalive_altitude_m));

    supervisor.sync_with_repository().await?;

    let caster_task = {
        let caster = caster.clone();
        tokio::spawn(async move { caster.start().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping relays");
    supervisor.shutdown().await;
    caster_task.abort();

    Ok(())
}
