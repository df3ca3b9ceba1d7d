//! Monitor binary that watches one address for incoming deposits.

use std::{io, sync::Arc};

use claimwatch_domain::config::MonitorConfig;
use claimwatch_domain::services::telemetry::{init_telemetry, TelemetryConfig};
use claimwatch_monitor::{run_monitor, MonitorError};
use claimwatch_storage::SeaOrmStorage;

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[monitor] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), MonitorError> {
    let config = MonitorConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("MONITOR");
    let _telemetry = init_telemetry(&telemetry_config)?;
    let storage = SeaOrmStorage::connect(config.database_url()).await?;
    run_monitor(config, Arc::new(storage)).await
}
