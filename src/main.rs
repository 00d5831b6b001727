use bike_telemetry::domain::models::{AppEvent, PeripheralHandle, SessionState};
use bike_telemetry::domain::settings::SettingsService;
use bike_telemetry::infrastructure::bluetooth::btleplug_backend::BtleplugCentral;
use bike_telemetry::infrastructure::bluetooth::BluetoothService;
use bike_telemetry::infrastructure::logging;
use bike_telemetry::infrastructure::storage::JsonFileStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// How long to wait for the last-used cluster before settling for another
const SCAN_WINDOW: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting Bike Telemetry");
    debug!("Settings loaded from {}", settings.path().display());

    let central = Arc::new(BtleplugCentral::new().await?);
    let mut service = BluetoothService::init(central, settings.get());
    if settings.get().cache_catalog_layouts {
        match JsonFileStore::default_location() {
            Ok(store) => service = service.with_layout_cache(Arc::new(store)),
            Err(e) => warn!("Layout cache unavailable: {}", e),
        }
    }

    let mut events = service.subscribe_events();
    if let Err(e) = service.start_scan().await {
        error!("Scan failed: {}", e);
        export_event_log(&service);
        service.shutdown().await;
        return Err(e.into());
    }

    let preferred = settings.get().last_connected_id.clone();
    let target = tokio::select! {
        found = pick_device(&mut events, preferred.as_deref()) => found,
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(target) = target else {
        info!("No cluster selected");
        service.shutdown().await;
        return Ok(());
    };

    service.connect(target.clone()).await;

    let mut states = service.subscribe_state();
    let mut snapshots = service.subscribe_snapshots();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!("Session: {}", state);
                match state {
                    SessionState::Subscribed => {
                        if let Err(e) = settings.remember_device(&target.id) {
                            warn!("Could not remember {}: {}", target, e);
                        }
                    }
                    SessionState::Failed(ref e) => {
                        for attempt in e.attempts() {
                            info!("  {}", attempt);
                        }
                        break;
                    }
                    SessionState::Disconnected => break,
                    _ => {}
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    "{} km/h | {} rpm | gear {} | fuel {}% | {}{}{}{}",
                    snapshot.speed,
                    snapshot.rpm,
                    snapshot.gear,
                    snapshot.fuel_percent,
                    snapshot.mode,
                    if snapshot.high_beam { " HIGH" } else { "" },
                    if snapshot.hazards { " HAZ" } else { "" },
                    if snapshot.engine_check { " ENG" } else { "" },
                );
                if snapshot.battery {
                    debug!("Battery warning lit");
                }
            }
        }
    }

    export_event_log(&service);
    service.shutdown().await;

    Ok(())
}

fn export_event_log(service: &BluetoothService) {
    match service.export_logs() {
        Ok(destination) => info!("Event log written to {}", destination),
        Err(e) => error!("Event log export failed: {}", e),
    }
}

/// The last-used cluster if it shows up in time, otherwise the first found
async fn pick_device(
    events: &mut broadcast::Receiver<AppEvent>,
    preferred: Option<&str>,
) -> Option<PeripheralHandle> {
    let mut first = None;
    let deadline = tokio::time::sleep(SCAN_WINDOW);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return first,
            event = events.recv() => match event {
                Ok(AppEvent::DeviceFound(device)) => {
                    info!("Found {}", device);
                    if preferred.map_or(true, |id| id == device.id) {
                        return Some(device);
                    }
                    first.get_or_insert(device);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} events", skipped),
                Err(RecvError::Closed) => return first,
            },
        }
    }
}
