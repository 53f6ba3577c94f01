use std::sync::Arc;

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::time::sleep;

use coldchain_sync::bluetooth::BluerDevice;
use coldchain_sync::config::SyncConfig;
use coldchain_sync::database::PostgresStore;
use coldchain_sync::sync::{SensorOutcome, SyncOrchestrator, SyncReport};
use coldchain_sync::utils::format_datetime;

fn log_summary(report: &SyncReport) {
    if let Some(batch_error) = report.batch_error {
        warn!("Sync did not run: {}", batch_error.as_str());
        return;
    }

    let skipped = report
        .outcomes
        .values()
        .filter(|o| matches!(o, SensorOutcome::Skipped(_)))
        .count();
    let new_logs: usize = report
        .outcomes
        .values()
        .map(|o| match o {
            SensorOutcome::Synced { new_logs, .. } => *new_logs,
            _ => 0,
        })
        .sum();

    info!("Sync summary:");
    info!("  Sensors synced: {}", report.synced_count());
    info!("  Sensors skipped: {}", skipped);
    info!("  New logs saved: {}", new_logs);
    for (sensor_id, kind) in report.failures() {
        warn!("  Sensor {} failed: {}", sensor_id, kind);
    }
}

async fn main_loop(config: SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting cold-chain sync service");

    let store = Arc::new(PostgresStore::new(
        &config.database_url,
        config.database_retry,
    ));
    store.ensure_schema().await?;

    let device = BluerDevice::new(config.device_timeout).await?;
    let orchestrator = SyncOrchestrator::new(device, store, config.device_retry);

    loop {
        info!(
            "Starting sync at: {}",
            format_datetime(&OffsetDateTime::now_utc())
        );

        match orchestrator.sync_all().await {
            Ok(report) => log_summary(&report),
            Err(e) => error!("Could not list sensors: {}", e),
        }

        info!(
            "Waiting {} seconds until next sync",
            config.sync_interval.as_secs()
        );
        sleep(config.sync_interval).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SyncConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Run main loop until Ctrl+C
    tokio::select! {
        result = main_loop(config) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
