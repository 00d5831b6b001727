//! BLE Scanner Module
//!
//! Handles Bluetooth LE device discovery. The result set is keyed by device
//! identity; repeat sightings of the same device are suppressed.

use crate::domain::errors::BleError;
use crate::domain::models::{AppEvent, PeripheralHandle};
use crate::infrastructure::bluetooth::transport::{Advertisement, BleCentral};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::storage::PermissionProvider;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Devices seen during the current scan, in first-seen order
#[derive(Debug, Default)]
pub struct ScanResults {
    devices: Vec<PeripheralHandle>,
    seen: HashSet<String>,
}

impl ScanResults {
    /// Record an advertisement; returns the handle only for a new device
    ///
    /// Advertisements without a name are ignored, as are names not matching
    /// `name_filter` (case-insensitive substring).
    pub fn observe(
        &mut self,
        advertisement: Advertisement,
        name_filter: Option<&str>,
    ) -> Option<PeripheralHandle> {
        let name = advertisement.local_name.filter(|name| !name.trim().is_empty())?;

        if let Some(filter) = name_filter {
            if !name.to_lowercase().contains(&filter.to_lowercase()) {
                return None;
            }
        }

        if !self.seen.insert(advertisement.id.clone()) {
            return None;
        }

        let handle = PeripheralHandle {
            id: advertisement.id,
            name,
            rssi: advertisement.rssi,
        };
        self.devices.push(handle.clone());
        Some(handle)
    }

    pub fn devices(&self) -> &[PeripheralHandle] {
        &self.devices
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.seen.clear();
    }
}

/// BLE Scanner for discovering bike clusters
pub struct BleScanner {
    central: Arc<dyn BleCentral>,
    permissions: Arc<dyn PermissionProvider>,
    event_log: EventLog,
    event_sender: broadcast::Sender<AppEvent>,
    results: Arc<Mutex<ScanResults>>,
    name_filter: Option<String>,
    task: Option<JoinHandle<()>>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(
        central: Arc<dyn BleCentral>,
        permissions: Arc<dyn PermissionProvider>,
        event_log: EventLog,
        event_sender: broadcast::Sender<AppEvent>,
    ) -> Self {
        Self {
            central,
            permissions,
            event_log,
            event_sender,
            results: Arc::new(Mutex::new(ScanResults::default())),
            name_filter: None,
            task: None,
        }
    }

    /// Only report devices whose name contains `filter`
    pub fn set_name_filter(&mut self, filter: Option<String>) {
        self.name_filter = filter.filter(|f| !f.trim().is_empty());
    }

    /// Start an indefinite scan
    ///
    /// Failures are terminal; the caller decides whether to call again.
    pub async fn start(&mut self) -> Result<(), BleError> {
        // Stop any existing scan
        self.stop().await?;

        if !self.permissions.request() {
            self.event_log.error("Permissions not granted.");
            return Err(BleError::PermissionDenied);
        }

        let mut advertisements = match self.central.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                self.event_log.error(format!("Scan error: {}", e));
                return Err(e);
            }
        };

        lock(&self.results).clear();
        self.event_log.info("Scanning started...");

        let results = self.results.clone();
        let sender = self.event_sender.clone();
        let filter = self.name_filter.clone();
        let log = self.event_log.clone();

        self.task = Some(tokio::spawn(async move {
            while let Some(advertisement) = advertisements.next().await {
                let found = lock(&results).observe(advertisement, filter.as_deref());
                if let Some(device) = found {
                    debug!("Discovered {}", device);
                    log.info(format!("Found device {}", device));
                    let _ = sender.send(AppEvent::DeviceFound(device));
                }
            }
            debug!("Advertisement stream ended");
        }));

        Ok(())
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<(), BleError> {
        if let Some(task) = self.task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.central.stop_scan().await?;
            self.event_log.info("Scan stopped.");
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Devices found by the current (or last) scan
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        lock(&self.results).devices().to_vec()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn lock(results: &Mutex<ScanResults>) -> MutexGuard<'_, ScanResults> {
    results
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
