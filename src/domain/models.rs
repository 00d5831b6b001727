use crate::domain::errors::BleError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Gear label shown when the cluster reports gear 0
pub const NEUTRAL_GEAR: &str = "N";

/// Riding mode label; the reference frame layout does not carry the mode
pub const DEFAULT_MODE: &str = "Road";

/// Decoded bike state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// km/h
    pub speed: u8,
    pub rpm: u16,
    pub gear: String,
    /// 0-100
    pub fuel_percent: u8,
    pub mode: String,

    // Indicator lamps
    pub high_beam: bool,
    pub hazards: bool,
    pub engine_check: bool,
    pub battery: bool,
}

impl TelemetrySnapshot {
    /// Zeroed snapshot shown whenever no live stream is attached
    pub fn disconnected() -> Self {
        Self {
            speed: 0,
            rpm: 0,
            gear: NEUTRAL_GEAR.to_string(),
            fuel_percent: 0,
            mode: DEFAULT_MODE.to_string(),
            high_beam: false,
            hazards: false,
            engine_check: false,
            battery: false,
        }
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Platform identity (MAC address on Linux/Windows, UUID on macOS)
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Access property of a GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityFlag {
    Read,
    WriteWithResponse,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

impl CapabilityFlag {
    pub const ALL: [CapabilityFlag; 5] = [
        Self::Read,
        Self::WriteWithResponse,
        Self::WriteWithoutResponse,
        Self::Notify,
        Self::Indicate,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of [`CapabilityFlag`]s, stored as a bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, flag: CapabilityFlag) {
        self.0 |= flag.bit();
    }

    pub fn with(mut self, flag: CapabilityFlag) -> Self {
        self.insert(flag);
        self
    }

    pub fn contains(&self, flag: CapabilityFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// True if any of `flags` is present
    pub fn intersects(&self, flags: &[CapabilityFlag]) -> bool {
        flags.iter().any(|flag| self.contains(*flag))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CapabilityFlag> + '_ {
        CapabilityFlag::ALL
            .into_iter()
            .filter(move |flag| self.contains(*flag))
    }
}

impl FromIterator<CapabilityFlag> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = CapabilityFlag>>(iter: I) -> Self {
        let mut set = Self::empty();
        for flag in iter {
            set.insert(flag);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub capabilities: CapabilitySet,
}

impl Characteristic {
    pub fn is_writable(&self) -> bool {
        self.capabilities.intersects(&[
            CapabilityFlag::WriteWithResponse,
            CapabilityFlag::WriteWithoutResponse,
        ])
    }

    /// Preferred write mode: acknowledged when the characteristic supports it
    pub fn write_kind(&self) -> WriteKind {
        if self.capabilities.contains(CapabilityFlag::WriteWithResponse) {
            WriteKind::WithResponse
        } else {
            WriteKind::WithoutResponse
        }
    }
}

/// A GATT service and its characteristics, in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// Outcome of one authentication strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStrategyResult {
    pub strategy: String,
    pub succeeded: bool,
    pub detail: String,
}

impl fmt::Display for AuthStrategyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.succeeded { "ok" } else { "failed" };
        write!(f, "{} [{}]: {}", self.strategy, verdict, self.detail)
    }
}

/// Lifecycle state of the connection session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Negotiating,
    Subscribed,
    Disconnected,
    Failed(BleError),
}

impl SessionState {
    /// A session owns the link in these states
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Discovering | Self::Negotiating | Self::Subscribed
        )
    }

    /// Terminal states; the next connect starts from Idle
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning..."),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Discovering => write!(f, "Discovering..."),
            Self::Negotiating => write!(f, "Negotiating..."),
            Self::Subscribed => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// One Event Log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub severity: MessageSeverity,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.message
        )
    }
}

/// Everything published to collaborators
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(PeripheralHandle),
    StateChanged(SessionState),
    Telemetry(TelemetrySnapshot),
    LogMessage(LogEntry),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_intersects() {
        let set = CapabilitySet::empty()
            .with(CapabilityFlag::Read)
            .with(CapabilityFlag::Indicate);

        assert!(set.intersects(&[CapabilityFlag::Notify, CapabilityFlag::Indicate]));
        assert!(!set.intersects(&[CapabilityFlag::WriteWithResponse]));
        assert!(!set.intersects(&[]));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![CapabilityFlag::Read, CapabilityFlag::Indicate]
        );
    }

    #[test]
    fn test_write_kind_prefers_response() {
        let both = Characteristic {
            uuid: Uuid::nil(),
            service_uuid: Uuid::nil(),
            capabilities: [
                CapabilityFlag::WriteWithoutResponse,
                CapabilityFlag::WriteWithResponse,
            ]
            .into_iter()
            .collect(),
        };
        assert!(both.is_writable());
        assert_eq!(both.write_kind(), WriteKind::WithResponse);
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Negotiating.is_in_progress());
        assert!(!SessionState::Scanning.is_in_progress());
        assert!(SessionState::Failed(BleError::PermissionDenied).is_ended());
        assert!(!SessionState::Idle.is_ended());
    }
}
