//! Shared session state
//!
//! State, snapshot and catalog are written only by the active session. Every
//! write carries the writer's [`SessionId`] and is dropped if a newer session
//! has started since, so late callbacks from a torn-down link cannot touch
//! the current one.

use crate::domain::models::{AppEvent, AuthStrategyResult, SessionState, TelemetrySnapshot};
use crate::infrastructure::bluetooth::catalog::CapabilityCatalog;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

/// Monotonic identifier of a connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

struct Inner {
    current: SessionId,
    catalog: CapabilityCatalog,
    attempts: Vec<AuthStrategyResult>,
}

pub struct SessionShared {
    inner: Mutex<Inner>,
    state_sender: watch::Sender<SessionState>,
    snapshot_sender: watch::Sender<TelemetrySnapshot>,
    event_sender: broadcast::Sender<AppEvent>,
}

impl SessionShared {
    pub fn new(event_sender: broadcast::Sender<AppEvent>) -> Self {
        let (state_sender, _) = watch::channel(SessionState::Idle);
        let (snapshot_sender, _) = watch::channel(TelemetrySnapshot::disconnected());
        Self {
            inner: Mutex::new(Inner {
                current: SessionId(0),
                catalog: CapabilityCatalog::new(),
                attempts: Vec::new(),
            }),
            state_sender,
            snapshot_sender,
            event_sender,
        }
    }

    /// Start a new session, invalidating whichever one was current
    pub fn begin(&self) -> SessionId {
        let mut inner = self.lock();
        inner.current = SessionId(inner.current.0 + 1);
        inner.attempts.clear();
        debug!("Session {} is now current", inner.current.0);
        inner.current
    }

    /// Invalidate the current session without starting another
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.current = SessionId(inner.current.0 + 1);
        debug!("Session ids advanced to {}", inner.current.0);
    }

    pub fn is_current(&self, id: SessionId) -> bool {
        self.lock().current == id
    }

    /// Apply a transition on behalf of session `id`; false if stale
    pub fn transition(&self, id: SessionId, state: SessionState) -> bool {
        let mut inner = self.lock();
        if inner.current != id {
            trace!("Dropping stale transition to {} from session {}", state, id.0);
            return false;
        }
        self.apply_state(&mut inner, state);
        true
    }

    /// Apply a transition regardless of session (scanner, teardown)
    pub fn force_state(&self, state: SessionState) {
        let mut inner = self.lock();
        self.apply_state(&mut inner, state);
    }

    /// Replace the snapshot; only while `id` is current and subscribed
    pub fn apply_snapshot(&self, id: SessionId, snapshot: TelemetrySnapshot) -> bool {
        let inner = self.lock();
        let subscribed = *self.state_sender.borrow() == SessionState::Subscribed;
        if inner.current != id || !subscribed {
            return false;
        }
        self.snapshot_sender.send_replace(snapshot.clone());
        let _ = self.event_sender.send(AppEvent::Telemetry(snapshot));
        true
    }

    pub fn install_catalog(&self, id: SessionId, catalog: CapabilityCatalog) -> bool {
        let mut inner = self.lock();
        if inner.current != id {
            return false;
        }
        inner.catalog = catalog;
        true
    }

    pub fn record_attempts(&self, id: SessionId, attempts: Vec<AuthStrategyResult>) -> bool {
        let mut inner = self.lock();
        if inner.current != id {
            return false;
        }
        inner.attempts = attempts;
        true
    }

    pub fn state(&self) -> SessionState {
        self.state_sender.borrow().clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_sender.borrow().clone()
    }

    pub fn catalog(&self) -> CapabilityCatalog {
        self.lock().catalog.clone()
    }

    pub fn attempts(&self) -> Vec<AuthStrategyResult> {
        self.lock().attempts.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_sender.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot_sender.subscribe()
    }

    fn apply_state(&self, inner: &mut Inner, state: SessionState) {
        // Leaving Subscribed in any direction blanks the readings
        if state != SessionState::Subscribed {
            let reset = TelemetrySnapshot::disconnected();
            let already_reset = *self.snapshot_sender.borrow() == reset;
            if !already_reset {
                self.snapshot_sender.send_replace(reset.clone());
                let _ = self.event_sender.send(AppEvent::Telemetry(reset));
            }
        }
        if state.is_ended() || state == SessionState::Idle {
            inner.catalog.clear();
        }

        debug!("Session state -> {}", state);
        self.state_sender.send_replace(state.clone());
        let _ = self.event_sender.send(AppEvent::StateChanged(state));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::BleError;
    use crate::domain::models::Service;
    use uuid::Uuid;

    fn shared() -> SessionShared {
        let (tx, _) = broadcast::channel(64);
        SessionShared::new(tx)
    }

    fn live_snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            speed: 88,
            rpm: 4200,
            gear: "4".into(),
            ..TelemetrySnapshot::disconnected()
        }
    }

    fn catalog() -> CapabilityCatalog {
        CapabilityCatalog::from_services(vec![Service {
            uuid: Uuid::from_u128(1),
            characteristics: Vec::new(),
        }])
    }

    #[test]
    fn test_stale_session_updates_are_dropped() {
        let shared = shared();
        let old = shared.begin();
        assert!(shared.transition(old, SessionState::Connecting));

        let new = shared.begin();
        assert!(new > old);
        assert!(!shared.transition(old, SessionState::Subscribed));
        assert!(!shared.install_catalog(old, catalog()));
        assert!(!shared.apply_snapshot(old, live_snapshot()));
        assert_eq!(shared.state(), SessionState::Connecting);
        assert!(shared.catalog().is_empty());
    }

    #[test]
    fn test_snapshot_only_applies_while_subscribed() {
        let shared = shared();
        let id = shared.begin();
        shared.transition(id, SessionState::Negotiating);
        assert!(!shared.apply_snapshot(id, live_snapshot()));

        shared.transition(id, SessionState::Subscribed);
        assert!(shared.apply_snapshot(id, live_snapshot()));
        assert_eq!(shared.snapshot(), live_snapshot());
    }

    #[test]
    fn test_ending_states_reset_snapshot_and_catalog() {
        for end in [
            SessionState::Disconnected,
            SessionState::Failed(BleError::DiscoveryFailed("gone".into())),
        ] {
            let shared = shared();
            let id = shared.begin();
            shared.transition(id, SessionState::Discovering);
            shared.install_catalog(id, catalog());
            shared.transition(id, SessionState::Subscribed);
            shared.apply_snapshot(id, live_snapshot());

            shared.transition(id, end.clone());

            assert_eq!(shared.state(), end);
            assert_eq!(shared.snapshot(), TelemetrySnapshot::disconnected());
            assert!(shared.catalog().is_empty());
        }
    }

    #[test]
    fn test_invalidate_blocks_current_writer() {
        let shared = shared();
        let id = shared.begin();
        shared.invalidate();
        assert!(!shared.is_current(id));
        assert!(!shared.record_attempts(id, Vec::new()));
    }
}
