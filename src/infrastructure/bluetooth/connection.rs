//! BLE Connection Module
//!
//! Drives one physical link through its lifecycle:
//! connect → discover → negotiate → subscribe → stream → disconnect.

use crate::domain::errors::BleError;
use crate::domain::models::{CapabilityFlag, PeripheralHandle, SessionState, TelemetrySnapshot};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::catalog::CapabilityCatalog;
use crate::infrastructure::bluetooth::negotiator::{
    build_chain, negotiate, AuthStrategy, StrategyExecutor, StrategyOutcome,
};
use crate::infrastructure::bluetooth::protocol::{self, DEFAULT_AUTH_KEY};
use crate::infrastructure::bluetooth::session_state::{SessionId, SessionShared};
use crate::infrastructure::bluetooth::transport::{BleCentral, BleLink, FrameStream};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::storage::KeyValueStore;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const NOTIFY_FLAGS: [CapabilityFlag; 2] = [CapabilityFlag::Notify, CapabilityFlag::Indicate];
const WRITE_FLAGS: [CapabilityFlag; 2] = [
    CapabilityFlag::WriteWithResponse,
    CapabilityFlag::WriteWithoutResponse,
];

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on establishing the physical link
    pub connect_timeout: Duration,
    /// Bound on service/characteristic enumeration
    pub discovery_timeout: Duration,
    /// How long a strategy waits for its first well-formed frame
    pub first_frame_timeout: Duration,
    /// Credential written by the generic key-write strategy
    pub auth_key: Vec<u8>,
    /// Negotiation chain, in priority order
    pub strategies: Vec<AuthStrategy>,
    /// Write every decoded frame to the Event Log
    pub log_decoded_frames: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            first_frame_timeout: Duration::from_secs(5),
            auth_key: DEFAULT_AUTH_KEY.as_bytes().to_vec(),
            strategies: AuthStrategy::default_chain(),
            log_decoded_frames: false,
        }
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: Duration::from_millis(settings.ble_connect_timeout_ms),
            discovery_timeout: Duration::from_millis(settings.ble_discovery_timeout_ms),
            first_frame_timeout: Duration::from_millis(settings.ble_first_frame_timeout_ms),
            auth_key: settings.ble_auth_key.as_bytes().to_vec(),
            strategies: build_chain(&settings.ble_custom_auth_writes),
            log_decoded_frames: settings.debug_raw_data_logging,
        }
    }
}

/// Link owned by the running session, reachable for teardown
pub type LinkSlot = Arc<Mutex<Option<Arc<dyn BleLink>>>>;

/// Key under which a device's service layout is cached
pub fn layout_cache_key(device_id: &str) -> String {
    format!("uuid_{}", device_id)
}

/// Why a session stopped before streaming
enum SessionEnd {
    Failed(BleError),
    /// A newer session took over; nothing may be written
    Superseded,
}

/// One connection attempt to one peripheral
pub struct ConnectionSession {
    id: SessionId,
    peripheral: PeripheralHandle,
    central: Arc<dyn BleCentral>,
    shared: Arc<SessionShared>,
    event_log: EventLog,
    config: ConnectionConfig,
    layout_cache: Option<Arc<dyn KeyValueStore>>,
    link_slot: LinkSlot,
}

impl ConnectionSession {
    pub fn new(
        id: SessionId,
        peripheral: PeripheralHandle,
        central: Arc<dyn BleCentral>,
        shared: Arc<SessionShared>,
        event_log: EventLog,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            id,
            peripheral,
            central,
            shared,
            event_log,
            config,
            layout_cache: None,
            link_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Store each discovered layout under [`layout_cache_key`]
    pub fn with_layout_cache(mut self, cache: Arc<dyn KeyValueStore>) -> Self {
        self.layout_cache = Some(cache);
        self
    }

    pub fn link_slot(&self) -> LinkSlot {
        self.link_slot.clone()
    }

    /// Drive the session until the link ends or fails
    pub async fn run(self) {
        match self.establish().await {
            Ok(frames) => self.stream_telemetry(frames).await,
            Err(SessionEnd::Failed(e)) => self.fail(e).await,
            Err(SessionEnd::Superseded) => {
                debug!("Session {} superseded before streaming", self.id.value());
                self.release_link().await;
            }
        }
    }

    async fn establish(&self) -> Result<FrameStream, SessionEnd> {
        self.advance(SessionState::Connecting)?;
        self.event_log
            .info(format!("Attempting connection to {}", self.peripheral));

        // Step 1: Physical link
        let link = match timeout(
            self.config.connect_timeout,
            self.central.connect(&self.peripheral),
        )
        .await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(SessionEnd::Failed(as_link_error(e))),
            Err(_) => {
                // The platform may still finish the connect we stopped waiting for
                if let Err(e) = self.central.disconnect_peripheral(&self.peripheral).await {
                    debug!("Releasing abandoned connect to {}: {}", self.peripheral, e);
                }
                return Err(SessionEnd::Failed(BleError::LinkEstablishFailed(format!(
                    "no link after {} ms",
                    self.config.connect_timeout.as_millis()
                ))))
            }
        };
        *self.lock_slot() = Some(link.clone());

        // Step 2: Full enumeration, catalog built exactly once
        self.advance(SessionState::Discovering)?;
        self.event_log
            .info("Connection successful. Discovering services...");

        let services = match timeout(self.config.discovery_timeout, link.discover_services()).await
        {
            Ok(Ok(services)) => services,
            Ok(Err(e)) => return Err(SessionEnd::Failed(as_discovery_error(e))),
            Err(_) => {
                return Err(SessionEnd::Failed(BleError::DiscoveryFailed(format!(
                    "enumeration did not finish within {} ms",
                    self.config.discovery_timeout.as_millis()
                ))))
            }
        };

        let mut catalog = CapabilityCatalog::from_services(services);
        self.event_log.info(format!(
            "Discovered {} services ({} characteristics).",
            catalog.services().len(),
            catalog.characteristic_count()
        ));
        self.cache_layout(&catalog);
        catalog.seal();
        if !self.shared.install_catalog(self.id, catalog.clone()) {
            return Err(SessionEnd::Superseded);
        }

        // Step 3: Negotiate a data path
        self.advance(SessionState::Negotiating)?;
        let mut executor = LinkExecutor {
            link: link.as_ref(),
            catalog: &catalog,
            config: &self.config,
            log: &self.event_log,
            frames: None,
            first_snapshot: None,
        };
        let negotiation = negotiate(&self.config.strategies, &mut executor, &self.event_log).await;
        if !self
            .shared
            .record_attempts(self.id, negotiation.attempts.clone())
        {
            return Err(SessionEnd::Superseded);
        }
        let (strategy, attempts) = negotiation.into_result().map_err(SessionEnd::Failed)?;

        let (frames, first_snapshot) = executor
            .into_stream()
            .ok_or(SessionEnd::Failed(BleError::AuthenticationExhausted(attempts)))?;

        // Step 4: Live
        self.advance(SessionState::Subscribed)?;
        self.event_log.success(format!(
            "Successfully subscribed to data stream via {}.",
            strategy
        ));
        self.shared.apply_snapshot(self.id, first_snapshot);

        Ok(frames)
    }

    /// Apply snapshots in arrival order until the stream ends
    async fn stream_telemetry(&self, mut frames: FrameStream) {
        while let Some(bytes) = frames.next().await {
            match protocol::decode(&bytes) {
                Ok(snapshot) => {
                    trace!(
                        "Frame: speed={} rpm={} gear={}",
                        snapshot.speed,
                        snapshot.rpm,
                        snapshot.gear
                    );
                    if self.config.log_decoded_frames {
                        self.event_log.info(format!(
                            "Data parsed: Speed {} km/h, RPM {}",
                            snapshot.speed, snapshot.rpm
                        ));
                    }
                    if !self.shared.apply_snapshot(self.id, snapshot) {
                        debug!("Session {} no longer current", self.id.value());
                        return;
                    }
                }
                // Previous snapshot stays on screen
                Err(e) => self.event_log.warn(format!("Data parse error: {}", e)),
            }
        }

        if !self.shared.is_current(self.id) {
            return;
        }
        self.event_log
            .info(format!("Disconnected from {}.", self.peripheral.name));
        self.release_link().await;
        self.shared.transition(self.id, SessionState::Disconnected);
    }

    async fn fail(&self, error: BleError) {
        for attempt in error.attempts() {
            info!("  attempt: {}", attempt);
        }
        self.event_log.error(format!("Connection failed: {}", error));
        self.release_link().await;
        self.shared.transition(self.id, SessionState::Failed(error));
    }

    fn advance(&self, state: SessionState) -> Result<(), SessionEnd> {
        if self.shared.transition(self.id, state) {
            Ok(())
        } else {
            Err(SessionEnd::Superseded)
        }
    }

    fn cache_layout(&self, catalog: &CapabilityCatalog) {
        let Some(cache) = &self.layout_cache else {
            return;
        };
        let stored = serde_json::to_string(catalog)
            .map_err(anyhow::Error::from)
            .and_then(|json| cache.set(&layout_cache_key(&self.peripheral.id), &json));
        match stored {
            Ok(()) => debug!("Cached service layout for {}", self.peripheral.id),
            Err(e) => self
                .event_log
                .warn(format!("Could not cache service layout: {}", e)),
        }
    }

    async fn release_link(&self) {
        let link = self.lock_slot().take();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect after session end: {}", e);
            }
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn BleLink>>> {
        self.link_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn as_link_error(error: BleError) -> BleError {
    match error {
        BleError::LinkEstablishFailed(_) => error,
        other => BleError::LinkEstablishFailed(other.to_string()),
    }
}

fn as_discovery_error(error: BleError) -> BleError {
    match error {
        BleError::DiscoveryFailed(_) => error,
        other => BleError::DiscoveryFailed(other.to_string()),
    }
}

/// Runs negotiation strategies against the session's link
struct LinkExecutor<'a> {
    link: &'a dyn BleLink,
    catalog: &'a CapabilityCatalog,
    config: &'a ConnectionConfig,
    log: &'a EventLog,
    frames: Option<FrameStream>,
    first_snapshot: Option<TelemetrySnapshot>,
}

impl LinkExecutor<'_> {
    /// The live stream and its first frame, once a strategy succeeded
    fn into_stream(self) -> Option<(FrameStream, TelemetrySnapshot)> {
        Some((self.frames?, self.first_snapshot?))
    }

    /// Subscribe (once) to the first notifiable characteristic
    async fn subscribe_first_notifiable(&mut self) -> Result<Uuid, String> {
        let catalog = self.catalog;
        let characteristic = catalog
            .find(&NOTIFY_FLAGS)
            .ok_or_else(|| "no notifiable or indicatable characteristic".to_string())?;

        if self.frames.is_none() {
            self.log.info(format!(
                "Found potential data characteristic: {}. Subscribing...",
                characteristic.uuid
            ));
            let frames = self
                .link
                .subscribe(characteristic)
                .await
                .map_err(|e| format!("subscription to {} failed: {}", characteristic.uuid, e))?;
            self.frames = Some(frames);
        }
        Ok(characteristic.uuid)
    }

    /// Wait for one well-formed frame; malformed ones are skipped
    async fn await_frame(&mut self) -> bool {
        let log = self.log;
        let Some(frames) = self.frames.as_mut() else {
            return false;
        };

        let wait = async {
            while let Some(bytes) = frames.next().await {
                match protocol::decode(&bytes) {
                    Ok(snapshot) => return Some(snapshot),
                    Err(e) => log.warn(format!("Ignoring frame during negotiation: {}", e)),
                }
            }
            None
        };
        let received = timeout(self.config.first_frame_timeout, wait).await;

        match received {
            Ok(Some(snapshot)) => {
                self.first_snapshot = Some(snapshot);
                true
            }
            Ok(None) => {
                warn!("Notification stream closed during negotiation");
                self.frames = None;
                false
            }
            Err(_) => false,
        }
    }

    /// Subscribe if needed, then require a well-formed frame
    async fn probe_stream(&mut self) -> Result<Uuid, String> {
        let uuid = self.subscribe_first_notifiable().await?;
        if self.await_frame().await {
            Ok(uuid)
        } else {
            Err(format!(
                "no well-formed frame on {} within {} ms",
                uuid,
                self.config.first_frame_timeout.as_millis()
            ))
        }
    }

    /// A precondition ran; success only if a live stream follows
    async fn probe_after(&mut self, done: String) -> StrategyOutcome {
        match self.probe_stream().await {
            Ok(uuid) => {
                StrategyOutcome::Established(format!("{}; data stream followed on {}", done, uuid))
            }
            Err(detail) => {
                StrategyOutcome::NotEstablished(format!("{} (attempt only); {}", done, detail))
            }
        }
    }

    async fn direct_notify(&mut self) -> StrategyOutcome {
        match self.probe_stream().await {
            Ok(uuid) => {
                StrategyOutcome::Established(format!("well-formed frame received on {}", uuid))
            }
            Err(detail) => StrategyOutcome::NotEstablished(detail),
        }
    }

    async fn write_then_probe(&mut self, target: Option<Uuid>, payload: &[u8]) -> StrategyOutcome {
        let catalog = self.catalog;
        let characteristic = match target {
            Some(uuid) => catalog.find_by_uuid(uuid).filter(|c| c.is_writable()),
            None => catalog.find(&WRITE_FLAGS),
        };
        let Some(characteristic) = characteristic else {
            let detail = match target {
                Some(uuid) => format!("writable characteristic {} not discovered", uuid),
                None => "no writable characteristic".to_string(),
            };
            return StrategyOutcome::NotEstablished(detail);
        };

        if let Err(e) = self
            .link
            .write(characteristic, payload, characteristic.write_kind())
            .await
        {
            self.log.warn(format!("Key write failed: {}", e));
            return StrategyOutcome::NotEstablished(format!(
                "write to {} failed: {}",
                characteristic.uuid, e
            ));
        }

        self.log
            .info("Key written. Now attempting to monitor for data again.");
        self.probe_after(format!(
            "{} byte(s) written to {}",
            payload.len(),
            characteristic.uuid
        ))
        .await
    }

    async fn bonding(&mut self) -> StrategyOutcome {
        // Advisory: a refused bond does not stop negotiation
        let done = match self.link.request_bonding().await {
            Ok(()) => {
                self.log.info("Bonding successful or already bonded.");
                "bonding accepted".to_string()
            }
            Err(e) => {
                self.log.warn(e.to_string());
                format!("bonding refused ({})", e)
            }
        };
        self.probe_after(done).await
    }
}

#[async_trait]
impl StrategyExecutor for LinkExecutor<'_> {
    async fn attempt(&mut self, strategy: &AuthStrategy) -> StrategyOutcome {
        match strategy {
            AuthStrategy::DirectNotify => self.direct_notify().await,
            AuthStrategy::GenericKeyWrite => {
                let config = self.config;
                self.write_then_probe(None, &config.auth_key).await
            }
            AuthStrategy::Bonding => self.bonding().await,
            AuthStrategy::CustomWrite {
                characteristic,
                payload,
            } => self.write_then_probe(Some(*characteristic), payload).await,
        }
    }
}
