//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, the connection session and the
//! Event Log for the bike cluster. It is the single owner of all three; no
//! state lives in globals.

use crate::domain::errors::BleError;
use crate::domain::models::{
    AppEvent, AuthStrategyResult, LogEntry, PeripheralHandle, SessionState, TelemetrySnapshot,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    catalog::CapabilityCatalog,
    connection::{layout_cache_key, ConnectionConfig, ConnectionSession, LinkSlot},
    scanner::BleScanner,
    session_state::{SessionId, SessionShared},
    transport::BleCentral,
};
use crate::infrastructure::event_log::EventLog;
use crate::infrastructure::storage::{
    DirectoryFileSink, FileSink, GrantedPermissions, KeyValueStore, PermissionProvider,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered events per subscriber before the slowest starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct ActiveSession {
    id: SessionId,
    peripheral: PeripheralHandle,
    task: JoinHandle<()>,
    link: LinkSlot,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    central: Arc<dyn BleCentral>,
    scanner: BleScanner,
    shared: Arc<SessionShared>,
    event_log: EventLog,
    event_sender: broadcast::Sender<AppEvent>,
    config: ConnectionConfig,
    name_filter: Option<String>,
    layout_cache: Option<Arc<dyn KeyValueStore>>,
    file_sink: Arc<dyn FileSink>,
    active: Option<ActiveSession>,
}

impl BluetoothService {
    /// Create the service around a radio
    pub fn init(central: Arc<dyn BleCentral>, settings: &Settings) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let event_log =
            EventLog::new(settings.event_log_capacity).with_events(event_sender.clone());
        let shared = Arc::new(SessionShared::new(event_sender.clone()));

        let mut scanner = BleScanner::new(
            central.clone(),
            Arc::new(GrantedPermissions),
            event_log.clone(),
            event_sender.clone(),
        );
        scanner.set_name_filter(settings.ble_name_filter.clone());

        Self {
            central,
            scanner,
            shared,
            event_log,
            event_sender,
            config: ConnectionConfig::from(settings),
            name_filter: settings.ble_name_filter.clone(),
            layout_cache: None,
            file_sink: Arc::new(DirectoryFileSink::default_location()),
            active: None,
        }
    }

    /// Gate scanning on the platform's permission prompt
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionProvider>) -> Self {
        self.scanner = BleScanner::new(
            self.central.clone(),
            permissions,
            self.event_log.clone(),
            self.event_sender.clone(),
        );
        self.scanner.set_name_filter(self.name_filter.clone());
        self
    }

    pub fn with_layout_cache(mut self, cache: Arc<dyn KeyValueStore>) -> Self {
        self.layout_cache = Some(cache);
        self
    }

    pub fn with_file_sink(mut self, sink: Arc<dyn FileSink>) -> Self {
        self.file_sink = sink;
        self
    }

    /// Start scanning for devices
    pub async fn start_scan(&mut self) -> Result<(), BleError> {
        let busy = self.shared.state().is_in_progress();

        match self.scanner.start().await {
            Ok(()) => {
                // A scan alongside a live session does not change its state
                if !busy {
                    self.shared.force_state(SessionState::Scanning);
                }
                Ok(())
            }
            Err(e) => {
                if !busy {
                    self.shared.force_state(SessionState::Failed(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Stop scanning
    pub async fn stop_scan(&mut self) -> Result<(), BleError> {
        self.scanner.stop().await?;
        if self.shared.state() == SessionState::Scanning {
            self.shared.force_state(SessionState::Idle);
        }
        Ok(())
    }

    /// Connect to a discovered device
    ///
    /// Any session still in progress is torn down first and reported as
    /// `Disconnected`; the new session then starts from `Idle`.
    pub async fn connect(&mut self, peripheral: PeripheralHandle) {
        if self.scanner.is_scanning() {
            if let Err(e) = self.scanner.stop().await {
                warn!("Failed to stop scan before connecting: {}", e);
            }
        }
        self.teardown_session().await;

        let id = self.shared.begin();
        if self.shared.state() != SessionState::Idle {
            self.shared.force_state(SessionState::Idle);
        }

        let mut session = ConnectionSession::new(
            id,
            peripheral.clone(),
            self.central.clone(),
            self.shared.clone(),
            self.event_log.clone(),
            self.config.clone(),
        );
        if let Some(cache) = &self.layout_cache {
            session = session.with_layout_cache(cache.clone());
        }
        let link = session.link_slot();

        info!("Starting session {} for {}", id.value(), peripheral);
        let task = tokio::spawn(session.run());
        self.active = Some(ActiveSession {
            id,
            peripheral,
            task,
            link,
        });
    }

    /// Disconnect from the current device
    pub async fn disconnect(&mut self) {
        self.teardown_session().await;
    }

    /// Drop any session or scan and return to `Idle`
    pub async fn reset(&mut self) {
        self.teardown_session().await;
        if let Err(e) = self.scanner.stop().await {
            warn!("Failed to stop scan during reset: {}", e);
        }
        self.shared.invalidate();
        self.shared.force_state(SessionState::Idle);
    }

    /// Tear everything down
    pub async fn shutdown(mut self) {
        info!("Shutting down Bluetooth service");
        self.reset().await;
    }

    async fn teardown_session(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        // Stale writes from the old session are dropped from here on
        self.shared.invalidate();
        active.task.abort();
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                warn!("Session {} ended abnormally: {}", active.id.value(), e);
            }
        }

        let link = active
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let in_progress = self.shared.state().is_in_progress();
        match link {
            Some(link) => {
                if let Err(e) = link.disconnect().await {
                    debug!("Disconnect of {} reported: {}", active.peripheral, e);
                }
            }
            // Aborted mid-connect: the platform may still bring the link up
            None if in_progress => {
                if let Err(e) = self.central.disconnect_peripheral(&active.peripheral).await {
                    debug!("Release of {} reported: {}", active.peripheral, e);
                }
            }
            None => {}
        }

        if in_progress {
            self.event_log
                .info(format!("Disconnected from {}.", active.peripheral.name));
            self.shared.force_state(SessionState::Disconnected);
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.shared.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.subscribe_state()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.shared.subscribe_snapshots()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.event_sender.subscribe()
    }

    /// Event Log entries, newest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.event_log.entries()
    }

    /// Write the Event Log through the file sink; returns the destination
    pub fn export_logs(&self) -> anyhow::Result<String> {
        self.event_log.export(self.file_sink.as_ref())
    }

    /// Strategy results of the current (or last) negotiation
    pub fn attempts(&self) -> Vec<AuthStrategyResult> {
        self.shared.attempts()
    }

    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.scanner.devices()
    }

    pub fn catalog(&self) -> CapabilityCatalog {
        self.shared.catalog()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// The peripheral the current session was started for
    pub fn active_peripheral(&self) -> Option<&PeripheralHandle> {
        self.active.as_ref().map(|active| &active.peripheral)
    }

    /// Layout cached by an earlier session with this device, if any
    pub fn cached_layout(&self, peripheral: &PeripheralHandle) -> Option<CapabilityCatalog> {
        let cache = self.layout_cache.as_ref()?;
        match cache.get(&layout_cache_key(&peripheral.id)) {
            Ok(Some(json)) => serde_json::from_str(&json)
                .map_err(|e| warn!("Ignoring unreadable cached layout: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Layout cache read failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::simulated::{
        SimAccess, SimBehavior, SimulatedCentral, SimulatedPeripheral, SAMPLE_FRAME,
    };
    use crate::infrastructure::bluetooth::protocol;
    use crate::infrastructure::event_log::EXPORT_FILE_NAME;
    use crate::infrastructure::storage::JsonFileStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn settings() -> Settings {
        Settings {
            ble_first_frame_timeout_ms: 100,
            ble_connect_timeout_ms: 1_000,
            ble_discovery_timeout_ms: 1_000,
            ..Settings::default()
        }
    }

    fn service_with(peripherals: &[SimulatedPeripheral]) -> BluetoothService {
        let central = SimulatedCentral::new();
        for peripheral in peripherals {
            central.add_peripheral(peripheral.clone());
        }
        BluetoothService::init(Arc::new(central), &settings())
    }

    async fn wait_for(
        states: &mut watch::Receiver<SessionState>,
        wanted: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        timeout(Duration::from_secs(2), async {
            loop {
                let state = states.borrow_and_update().clone();
                if wanted(&state) {
                    return state;
                }
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for session state")
    }

    fn slow_cluster(id: &str) -> SimulatedPeripheral {
        SimulatedPeripheral::new(
            id,
            "Slow cluster",
            SimulatedPeripheral::cluster_services(),
            SimBehavior {
                connect_delay: Duration::from_millis(300),
                ..SimBehavior::default()
            },
        )
    }

    #[tokio::test]
    async fn test_scan_then_connect_streams_telemetry() {
        let cluster = SimulatedPeripheral::open_cluster("AA:01", "Yezdi Roadster");
        let mut service = service_with(&[cluster.clone()]);
        let mut states = service.subscribe_state();

        service.start_scan().await.unwrap();
        assert_eq!(service.state(), SessionState::Scanning);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let found = service.devices();
        assert_eq!(found.len(), 1);

        service.connect(found[0].clone()).await;
        assert!(!service.is_scanning());
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;

        assert_eq!(service.snapshot(), protocol::decode(&SAMPLE_FRAME).unwrap());
        assert_eq!(service.catalog().characteristic_count(), 2);
        assert_eq!(service.active_peripheral().map(|p| p.id.as_str()), Some("AA:01"));

        service.shutdown().await;
        assert!(!cluster.is_connected());
    }

    fn state_changes(events: &mut broadcast::Receiver<AppEvent>) -> Vec<SessionState> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        seen
    }

    /// Interrupt a session to `first` in `phase` with a connect to a second cluster
    async fn connect_over(
        first: &SimulatedPeripheral,
        phase: SessionState,
        settings: Settings,
    ) -> BluetoothService {
        let second = SimulatedPeripheral::open_cluster("X2", "Second");
        let central = SimulatedCentral::new();
        central.add_peripheral(first.clone());
        central.add_peripheral(second.clone());
        let mut service = BluetoothService::init(Arc::new(central), &settings);
        let mut events = service.subscribe_events();
        let mut states = service.subscribe_state();

        service.connect(first.handle()).await;
        wait_for(&mut states, |s| *s == phase).await;

        service.connect(second.handle()).await;
        assert!(!first.is_connected());
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;

        let seen = state_changes(&mut events);
        let disconnected = seen
            .iter()
            .position(|s| *s == SessionState::Disconnected)
            .expect("prior session was not reported as disconnected");
        let second_connecting = seen
            .iter()
            .rposition(|s| *s == SessionState::Connecting)
            .unwrap();
        assert!(disconnected < second_connecting);
        assert_eq!(service.active_peripheral().map(|p| p.id.as_str()), Some("X2"));
        assert!(second.is_connected());
        service
    }

    #[tokio::test]
    async fn test_new_connect_while_connecting_disconnects_prior() {
        let first = slow_cluster("S1");
        let service = connect_over(&first, SessionState::Connecting, settings()).await;

        // The slow link never completes; its late writes cannot land
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(service.state(), SessionState::Subscribed);
        assert_eq!(first.connects(), 0);
        assert!(!first.is_connected());
    }

    #[tokio::test]
    async fn test_new_connect_while_discovering_disconnects_prior() {
        let first = SimulatedPeripheral::new(
            "D1",
            "Slow GATT",
            SimulatedPeripheral::cluster_services(),
            SimBehavior {
                discovery_delay: Duration::from_millis(300),
                ..SimBehavior::default()
            },
        );
        let service = connect_over(&first, SessionState::Discovering, settings()).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(service.state(), SessionState::Subscribed);
        assert_eq!(service.catalog().characteristic_count(), 2);
        assert_eq!(first.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_new_connect_while_negotiating_disconnects_prior() {
        let first = SimulatedPeripheral::new(
            "N1",
            "Silent",
            SimulatedPeripheral::cluster_services(),
            SimBehavior {
                access: SimAccess::Never,
                ..SimBehavior::default()
            },
        );
        let patient = Settings {
            ble_first_frame_timeout_ms: 2_000,
            ..settings()
        };
        let service = connect_over(&first, SessionState::Negotiating, patient).await;

        assert_eq!(service.state(), SessionState::Subscribed);
        assert_eq!(first.subscriber_count(), 0);
        assert!(service.attempts().iter().any(|a| a.succeeded));
    }

    #[tokio::test]
    async fn test_new_connect_while_subscribed_disconnects_prior() {
        let first = SimulatedPeripheral::open_cluster("T1", "First");
        let second = SimulatedPeripheral::open_cluster("T2", "Second");
        let mut service = service_with(&[first.clone(), second.clone()]);
        let mut states = service.subscribe_state();

        service.connect(first.handle()).await;
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;
        assert!(first.is_connected());

        let mut events = service.subscribe_events();
        service.connect(second.handle()).await;
        assert!(!first.is_connected());

        match timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(AppEvent::StateChanged(state)) = events.recv().await {
                    return state;
                }
            }
        })
        .await
        {
            Ok(state) => assert_eq!(state, SessionState::Disconnected),
            Err(_) => panic!("no state change after second connect"),
        }
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_explicit_disconnect_resets_snapshot() {
        let cluster = SimulatedPeripheral::open_cluster("U1", "Cluster");
        let mut service = service_with(&[cluster.clone()]);
        let mut states = service.subscribe_state();

        service.connect(cluster.handle()).await;
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;

        service.disconnect().await;

        assert_eq!(service.state(), SessionState::Disconnected);
        assert_eq!(service.snapshot(), TelemetrySnapshot::disconnected());
        assert!(service.catalog().is_empty());
        assert!(!cluster.is_connected());

        service.reset().await;
        assert_eq!(service.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_session_reconnects_from_idle() {
        let broken = SimulatedPeripheral::new(
            "V1",
            "Broken",
            SimulatedPeripheral::cluster_services(),
            SimBehavior {
                fail_discovery: true,
                ..SimBehavior::default()
            },
        );
        let good = SimulatedPeripheral::open_cluster("V2", "Good");
        let mut service = service_with(&[broken.clone(), good.clone()]);
        let mut states = service.subscribe_state();

        service.connect(broken.handle()).await;
        wait_for(&mut states, |s| matches!(s, SessionState::Failed(_))).await;

        let mut events = service.subscribe_events();
        service.connect(good.handle()).await;
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;

        let first_change = loop {
            if let AppEvent::StateChanged(state) = events.recv().await.unwrap() {
                break state;
            }
        };
        assert_eq!(first_change, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_scan_without_radio_fails() {
        let central = SimulatedCentral::new();
        central.set_powered(false);
        let mut service = BluetoothService::init(Arc::new(central), &settings());

        let result = service.start_scan().await;

        assert!(matches!(result, Err(BleError::RadioUnavailable(_))));
        assert!(matches!(
            service.state(),
            SessionState::Failed(BleError::RadioUnavailable(_))
        ));
        assert!(service
            .logs()
            .iter()
            .any(|entry| entry.message.starts_with("Scan error")));
    }

    #[tokio::test]
    async fn test_stop_scan_returns_to_idle() {
        let mut service = service_with(&[]);
        service.start_scan().await.unwrap();
        service.stop_scan().await.unwrap();
        assert_eq!(service.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_export_logs_and_cached_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = SimulatedPeripheral::open_cluster("W1", "Cached");
        let store = Arc::new(JsonFileStore::open(dir.path().join("layouts.json")).unwrap());
        let mut service = service_with(&[cluster.clone()])
            .with_layout_cache(store)
            .with_file_sink(Arc::new(DirectoryFileSink::new(dir.path())));
        let mut states = service.subscribe_state();

        assert!(service.cached_layout(&cluster.handle()).is_none());
        service.connect(cluster.handle()).await;
        wait_for(&mut states, |s| *s == SessionState::Subscribed).await;

        let cached = service.cached_layout(&cluster.handle()).unwrap();
        assert_eq!(cached.characteristic_count(), 2);

        let destination = service.export_logs().unwrap();
        assert!(destination.ends_with(EXPORT_FILE_NAME));
        let text = std::fs::read_to_string(dir.path().join(EXPORT_FILE_NAME)).unwrap();
        assert!(text.contains("Successfully subscribed"));

        service.shutdown().await;
    }
}
