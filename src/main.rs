use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use g7_cgm_bridge_lib::config::{self, AppConfig};
use g7_cgm_bridge_lib::core::sensor;
use g7_cgm_bridge_lib::{logging, BluestTransport, SensorEvent, SessionManager, StateStore};
use log::{error, info, warn};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit directory holds both the config and the saved state.
    let (config_dir, data_dir) = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(dir) => (dir.clone(), dir),
        None => (config::default_config_dir()?, config::default_data_dir()?),
    };
    logging::init(DEFAULT_LOG_LEVEL);
    info!("Using config directory {:?}", config_dir);
    let app_config = AppConfig::load_config(&config_dir).await?;
    logging::set_level(&app_config.log_level);

    let store = StateStore::new(&data_dir);
    let initial = store
        .load()
        .await
        .context("Refusing to start without the saved sensor state; fix or remove the file")?;

    let transport = BluestTransport::new(app_config.session.min_rssi).await?;
    let timings = app_config.sensor.timings();
    let (manager, _, mut events) =
        SessionManager::spawn_with_events(transport, app_config.session.clone(), timings, initial);

    let status = manager.scan_for_new_sensor().await?;
    info!("Session started, status {:?}", status);

    let mut lifecycle_timer = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = lifecycle_timer.tick() => {
                let state = manager.state();
                let status = sensor::lifecycle(&state, Utc::now(), &timings);
                match sensor::ends_at(&state, &timings) {
                    Some(ends_at) => info!(
                        "Sensor {:?}: {:?}, {:?} remaining, session ends {}",
                        manager.sensor_name(), status.state, status.remaining, ends_at
                    ),
                    None => info!("Sensor {:?}: {:?}", manager.sensor_name(), status.state),
                }
            }
            event = events.recv() => match event {
                Some(SensorEvent::StateUpdated(state)) => {
                    if let Err(e) = store.save(&state).await {
                        error!("Failed to save sensor state: {}", e);
                    }
                }
                Some(SensorEvent::ReadingReceived(reading)) => {
                    let glucose = reading
                        .glucose
                        .concentration()
                        .map(|value| format!("{:.1} mg/dL", value.mg_dl()))
                        .unwrap_or_else(|| format!("{:?}", reading.glucose));
                    info!(
                        "Glucose {} (trend {:?}, state {:?})",
                        glucose, reading.trend, reading.algorithm_state
                    );
                }
                Some(SensorEvent::StatusChanged(status)) => info!("Connection status: {:?}", status),
                Some(SensorEvent::SensorFailed(e)) => error!("{}", e),
                Some(SensorEvent::MalformedData { endpoint, len }) => {
                    warn!("Malformed {}-byte message on {:?}", len, endpoint)
                }
                Some(_) => {}
                None => {
                    warn!("Session event stream closed");
                    break;
                }
            },
        }
    }

    manager.shutdown().await;
    if let Err(e) = store.save(&manager.state()).await {
        error!("Failed to save sensor state: {}", e);
    }
    Ok(())
}
