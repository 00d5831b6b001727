//! In-process BLE simulator
//!
//! Simulated clusters that advertise, accept connections, expose a GATT
//! layout and push telemetry frames, entirely in-process. Used for tests and
//! for exercising the session without a bike nearby.

use crate::domain::errors::BleError;
use crate::domain::models::{
    CapabilityFlag, CapabilitySet, Characteristic, PeripheralHandle, Service, WriteKind,
};
use crate::infrastructure::bluetooth::transport::{
    receiver_stream, Advertisement, AdvertisementStream, BleCentral, BleLink, FrameStream,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub const CLUSTER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Sample frame: 45 km/h, 300 rpm, 3rd gear, 60% fuel, hazards + battery
pub const SAMPLE_FRAME: [u8; 6] = [45, 0x01, 0x2C, 0b0000_1010, 60, 3];

/// What unlocks the telemetry stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimAccess {
    /// Frames flow as soon as someone subscribes
    Open,
    /// Frames flow after this exact payload is written
    Key(Vec<u8>),
    /// Frames flow after a bonding request
    Bonding,
    /// Frames never flow
    Never,
}

#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub access: SimAccess,
    pub connect_delay: Duration,
    pub discovery_delay: Duration,
    pub fail_connect: bool,
    pub fail_discovery: bool,
    pub fail_subscribe: bool,
    pub fail_bonding: bool,
    /// Sent to subscribers the moment the stream unlocks
    pub greeting: Vec<Vec<u8>>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            access: SimAccess::Open,
            connect_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            fail_connect: false,
            fail_discovery: false,
            fail_subscribe: false,
            fail_bonding: false,
            greeting: vec![SAMPLE_FRAME.to_vec()],
        }
    }
}

struct PeripheralInner {
    handle: PeripheralHandle,
    services: Vec<Service>,
    behavior: SimBehavior,
    unlocked: AtomicBool,
    connected: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    bond_requests: AtomicUsize,
    connects: AtomicUsize,
}

impl PeripheralInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Vec<u8>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unlock(&self) {
        if self.unlocked.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Simulated {} unlocked", self.handle.id);
        let mut subscribers = self.subscribers();
        for frame in &self.behavior.greeting {
            subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        }
    }

    fn drop_subscribers(&self) {
        self.subscribers().clear();
    }
}

/// A simulated bike cluster; clones share state
#[derive(Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<PeripheralInner>,
}

impl SimulatedPeripheral {
    pub fn new(
        id: &str,
        name: &str,
        services: Vec<Service>,
        behavior: SimBehavior,
    ) -> Self {
        let unlocked = behavior.access == SimAccess::Open;
        Self {
            inner: Arc::new(PeripheralInner {
                handle: PeripheralHandle {
                    id: id.to_string(),
                    name: name.to_string(),
                    rssi: Some(-55),
                },
                services,
                behavior,
                unlocked: AtomicBool::new(unlocked),
                connected: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                bond_requests: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Telemetry (notify) + command (write) characteristics in one service
    pub fn cluster_services() -> Vec<Service> {
        vec![Service {
            uuid: CLUSTER_SERVICE_UUID,
            characteristics: vec![
                Characteristic {
                    uuid: TELEMETRY_CHAR_UUID,
                    service_uuid: CLUSTER_SERVICE_UUID,
                    capabilities: CapabilitySet::empty()
                        .with(CapabilityFlag::Read)
                        .with(CapabilityFlag::Notify),
                },
                Characteristic {
                    uuid: COMMAND_CHAR_UUID,
                    service_uuid: CLUSTER_SERVICE_UUID,
                    capabilities: CapabilitySet::empty()
                        .with(CapabilityFlag::WriteWithResponse)
                        .with(CapabilityFlag::WriteWithoutResponse),
                },
            ],
        }]
    }

    /// Cluster that streams to anyone who subscribes
    pub fn open_cluster(id: &str, name: &str) -> Self {
        Self::new(id, name, Self::cluster_services(), SimBehavior::default())
    }

    /// Cluster that streams only after `key` is written
    pub fn key_locked_cluster(id: &str, name: &str, key: &[u8]) -> Self {
        Self::new(
            id,
            name,
            Self::cluster_services(),
            SimBehavior {
                access: SimAccess::Key(key.to_vec()),
                ..SimBehavior::default()
            },
        )
    }

    pub fn handle(&self) -> PeripheralHandle {
        self.inner.handle.clone()
    }

    /// Push a frame to every subscriber; returns how many received it
    pub fn push_frame(&self, frame: &[u8]) -> usize {
        if !self.inner.unlocked.load(Ordering::SeqCst) {
            return 0;
        }
        let mut subscribers = self.inner.subscribers();
        subscribers.retain(|tx| tx.send(frame.to_vec()).is_ok());
        subscribers.len()
    }

    /// Peripheral-initiated disconnect
    pub fn drop_link(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.drop_subscribers();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn bond_requests(&self) -> usize {
        self.inner.bond_requests.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.inner.handle.id.clone(),
            local_name: Some(self.inner.handle.name.clone()),
            rssi: self.inner.handle.rssi,
        }
    }
}

/// Simulated radio holding a set of peripherals
pub struct SimulatedCentral {
    peripherals: Mutex<Vec<SimulatedPeripheral>>,
    powered: AtomicBool,
    scan_sender: Mutex<Option<mpsc::UnboundedSender<Advertisement>>>,
}

impl SimulatedCentral {
    pub fn new() -> Self {
        Self {
            peripherals: Mutex::new(Vec::new()),
            powered: AtomicBool::new(true),
            scan_sender: Mutex::new(None),
        }
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(peripheral);
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    /// Inject a raw advertisement into the running scan
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        self.scan_sender()
            .as_ref()
            .is_some_and(|tx| tx.send(advertisement).is_ok())
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_sender().is_some()
    }

    fn scan_sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Advertisement>>> {
        self.scan_sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn find(&self, id: &str) -> Option<SimulatedPeripheral> {
        self.peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|p| p.inner.handle.id == id)
            .cloned()
    }
}

impl Default for SimulatedCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleCentral for SimulatedCentral {
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError> {
        if !self.powered.load(Ordering::SeqCst) {
            return Err(BleError::RadioUnavailable("Bluetooth is PoweredOff".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peripherals = self
            .peripherals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for peripheral in &peripherals {
            let _ = tx.send(peripheral.advertisement());
        }
        *self.scan_sender() = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scan_sender().take();
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Arc<dyn BleLink>, BleError> {
        let target = self
            .find(&peripheral.id)
            .ok_or_else(|| BleError::LinkEstablishFailed(format!("{} not in range", peripheral)))?;
        let behavior = &target.inner.behavior;
        let refused = !self.powered.load(Ordering::SeqCst) || behavior.fail_connect;

        // The radio link is up before the host hears about it
        if !refused {
            target.inner.connected.store(true, Ordering::SeqCst);
        }
        if !behavior.connect_delay.is_zero() {
            tokio::time::sleep(behavior.connect_delay).await;
        }
        if refused {
            return Err(BleError::LinkEstablishFailed("connection refused".into()));
        }

        target.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedLink {
            peripheral: target.inner.clone(),
        }))
    }

    async fn disconnect_peripheral(&self, peripheral: &PeripheralHandle) -> Result<(), BleError> {
        if let Some(target) = self.find(&peripheral.id) {
            target.drop_link();
        }
        Ok(())
    }
}

struct SimulatedLink {
    peripheral: Arc<PeripheralInner>,
}

impl SimulatedLink {
    fn ensure_connected(&self) -> Result<(), BleError> {
        if self.peripheral.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::WriteFailed("not connected".into()))
        }
    }
}

#[async_trait]
impl BleLink for SimulatedLink {
    async fn discover_services(&self) -> Result<Vec<Service>, BleError> {
        if !self.peripheral.behavior.discovery_delay.is_zero() {
            tokio::time::sleep(self.peripheral.behavior.discovery_delay).await;
        }
        if self.peripheral.behavior.fail_discovery {
            return Err(BleError::DiscoveryFailed("GATT error 0x85".into()));
        }
        Ok(self.peripheral.services.clone())
    }

    async fn subscribe(&self, characteristic: &Characteristic) -> Result<FrameStream, BleError> {
        self.ensure_connected()?;
        if self.peripheral.behavior.fail_subscribe {
            return Err(BleError::WriteFailed("CCCD write rejected".into()));
        }
        if !characteristic
            .capabilities
            .intersects(&[CapabilityFlag::Notify, CapabilityFlag::Indicate])
        {
            return Err(BleError::WriteFailed(format!(
                "{} does not support notifications",
                characteristic.uuid
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.peripheral.unlocked.load(Ordering::SeqCst) {
            for frame in &self.peripheral.behavior.greeting {
                let _ = tx.send(frame.clone());
            }
        }
        self.peripheral.subscribers().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        payload: &[u8],
        _kind: WriteKind,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        if !characteristic.is_writable() {
            return Err(BleError::WriteFailed(format!(
                "{} is not writable",
                characteristic.uuid
            )));
        }

        self.peripheral
            .writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((characteristic.uuid, payload.to_vec()));

        if let SimAccess::Key(key) = &self.peripheral.behavior.access {
            if key.as_slice() == payload {
                self.peripheral.unlock();
            }
        }
        Ok(())
    }

    async fn request_bonding(&self) -> Result<(), BleError> {
        self.peripheral.bond_requests.fetch_add(1, Ordering::SeqCst);
        if self.peripheral.behavior.fail_bonding {
            return Err(BleError::BondingFailed("pairing rejected by peer".into()));
        }
        if self.peripheral.behavior.access == SimAccess::Bonding {
            self.peripheral.unlock();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.connected.store(false, Ordering::SeqCst);
        self.peripheral.drop_subscribers();
        Ok(())
    }
}
