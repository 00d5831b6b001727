//! Host Bluetooth radio via `btleplug`
//!
//! Adapts the platform central to [`BleCentral`] / [`BleLink`]. Peripheral
//! ids are the platform's `PeripheralId` rendered as a string.

use crate::domain::errors::BleError;
use crate::domain::models::{
    CapabilityFlag, CapabilitySet, Characteristic, PeripheralHandle, Service, WriteKind,
};
use crate::infrastructure::bluetooth::transport::{
    receiver_stream, Advertisement, AdvertisementStream, BleCentral, BleLink, FrameStream,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn radio_error(e: btleplug::Error) -> BleError {
    BleError::RadioUnavailable(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First host adapter, driven through btleplug
pub struct BtleplugCentral {
    adapter: Adapter,
    known: Arc<Mutex<HashMap<String, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(radio_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::RadioUnavailable("No Bluetooth adapter found".into()))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, BleError> {
        let cached = lock(&self.known).get(id).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }
        self.adapter
            .peripherals()
            .await
            .map_err(radio_error)?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| BleError::LinkEstablishFailed(format!("{} is no longer visible", id)))
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError> {
        let mut events = self.adapter.events().await.map_err(radio_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(radio_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let known = self.known.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Properties unavailable for {:?}: {}", id, e);
                        continue;
                    }
                };

                let key = peripheral.id().to_string();
                lock(&known).insert(key.clone(), peripheral);
                let advertisement = Advertisement {
                    id: key,
                    local_name: properties.local_name,
                    rssi: properties.rssi,
                };
                if tx.send(advertisement).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(receiver_stream(rx))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(radio_error)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<Arc<dyn BleLink>, BleError> {
        let peripheral = self.find_peripheral(&handle.id).await?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| BleError::LinkEstablishFailed(e.to_string()))?;
        }
        info!("Connected to {}", handle);

        Ok(Arc::new(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            forwarders: Mutex::new(Vec::new()),
        }))
    }

    async fn disconnect_peripheral(&self, handle: &PeripheralHandle) -> Result<(), BleError> {
        let peripheral = match self.find_peripheral(&handle.id).await {
            Ok(peripheral) => peripheral,
            Err(_) => return Ok(()),
        };
        if peripheral.is_connected().await.unwrap_or(true) {
            debug!("Releasing unowned link to {}", handle);
            peripheral
                .disconnect()
                .await
                .map_err(|e| BleError::LinkEstablishFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// A connected btleplug peripheral
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn platform_characteristic(
        &self,
        characteristic: &Characteristic,
    ) -> Option<btleplug::api::Characteristic> {
        self.peripheral.characteristics().into_iter().find(|c| {
            c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid
        })
    }
}

fn capabilities(properties: CharPropFlags) -> CapabilitySet {
    let mapping = [
        (CharPropFlags::READ, CapabilityFlag::Read),
        (CharPropFlags::WRITE, CapabilityFlag::WriteWithResponse),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CapabilityFlag::WriteWithoutResponse,
        ),
        (CharPropFlags::NOTIFY, CapabilityFlag::Notify),
        (CharPropFlags::INDICATE, CapabilityFlag::Indicate),
    ];
    mapping
        .into_iter()
        .filter(|(prop, _)| properties.contains(*prop))
        .map(|(_, flag)| flag)
        .collect()
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn discover_services(&self) -> Result<Vec<Service>, BleError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;

        // btleplug keeps services in a set ordered by UUID
        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| Service {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| Characteristic {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        capabilities: capabilities(c.properties),
                    })
                    .collect(),
            })
            .collect();
        Ok(services)
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<FrameStream, BleError> {
        let target = self.platform_characteristic(characteristic).ok_or_else(|| {
            BleError::WriteFailed(format!("{} not present on peripheral", characteristic.uuid))
        })?;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))?;
        let mut events = self.adapter.events().await.map_err(radio_error)?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = target.uuid;
        let peripheral_id = self.peripheral.id();

        // Ends the frame stream when the link drops
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuid => {
                            if tx.send(n.value).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("Peripheral {:?} disconnected", id);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        lock(&self.forwarders).push(forwarder);

        Ok(receiver_stream(rx))
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<(), BleError> {
        let target = self.platform_characteristic(characteristic).ok_or_else(|| {
            BleError::WriteFailed(format!("{} not present on peripheral", characteristic.uuid))
        })?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&target, payload, write_type)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    async fn request_bonding(&self) -> Result<(), BleError> {
        // Pairing is left to the OS; btleplug exposes no bonding call
        Err(BleError::BondingFailed(
            "bonding is not available through this radio backend".into(),
        ))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        for forwarder in lock(&self.forwarders).drain(..) {
            forwarder.abort();
        }
        match self.peripheral.is_connected().await {
            Ok(false) => Ok(()),
            _ => self.peripheral.disconnect().await.map_err(|e| {
                warn!("Disconnect failed: {}", e);
                BleError::LinkEstablishFailed(e.to_string())
            }),
        }
    }
}
