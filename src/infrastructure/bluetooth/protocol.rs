//! Bike Cluster Telemetry Protocol
//!
//! This module contains the frame layout for the telemetry notifications
//! pushed by the instrument cluster, plus the default credential used by the
//! generic key-write strategy.
//!
//! The layout below is a reference layout. A vendor-specific layout replaces
//! [`decode`] and [`encode`] without touching the session state machine.

use crate::domain::errors::DecodeError;
use crate::domain::models::{TelemetrySnapshot, DEFAULT_MODE, NEUTRAL_GEAR};
use tracing::{debug, trace};

/// Minimum telemetry frame length in bytes
pub const MIN_FRAME_LEN: usize = 6;

/// Credential written by the generic key-write strategy
pub const DEFAULT_AUTH_KEY: &str = "YEZDI_AUTH_DEFAULT";

/// Indicator bits of the flag byte
pub mod flags {
    pub const HIGH_BEAM: u8 = 1 << 0;
    pub const HAZARDS: u8 = 1 << 1;
    pub const ENGINE_CHECK: u8 = 1 << 2;
    pub const BATTERY: u8 = 1 << 3;
}

/// Decode a telemetry frame
///
/// # Frame Structure (6 bytes minimum)
///
/// ```text
/// [0] : Speed (u8, km/h)
/// [1] : RPM high byte
/// [2] : RPM low byte      -> rpm = (hi << 8) | lo
/// [3] : Flag byte
///       bit 0: High beam
///       bit 1: Hazards
///       bit 2: Engine check
///       bit 3: Battery
/// [4] : Fuel (percent)
/// [5] : Gear (0 = neutral)
/// ```
///
/// Trailing bytes beyond the sixth are ignored.
pub fn decode(bytes: &[u8]) -> Result<TelemetrySnapshot, DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        debug!(
            "Short telemetry frame: {} bytes (expected >= {})",
            bytes.len(),
            MIN_FRAME_LEN
        );
        return Err(DecodeError::MalformedFrame {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    trace!("Raw frame: {:02X?}", bytes);

    let flag_byte = bytes[3];

    Ok(TelemetrySnapshot {
        speed: bytes[0],
        rpm: u16::from_be_bytes([bytes[1], bytes[2]]),
        gear: gear_label(bytes[5]),
        fuel_percent: bytes[4].min(100),
        mode: DEFAULT_MODE.to_string(),
        high_beam: flag_byte & flags::HIGH_BEAM != 0,
        hazards: flag_byte & flags::HAZARDS != 0,
        engine_check: flag_byte & flags::ENGINE_CHECK != 0,
        battery: flag_byte & flags::BATTERY != 0,
    })
}

/// Encode a snapshot back into the reference frame layout
///
/// Used by the simulated cluster. A gear label that is neither `"N"` nor a
/// number encodes as neutral.
pub fn encode(snapshot: &TelemetrySnapshot) -> [u8; MIN_FRAME_LEN] {
    let [rpm_hi, rpm_lo] = snapshot.rpm.to_be_bytes();

    let mut flag_byte = 0;
    for (set, bit) in [
        (snapshot.high_beam, flags::HIGH_BEAM),
        (snapshot.hazards, flags::HAZARDS),
        (snapshot.engine_check, flags::ENGINE_CHECK),
        (snapshot.battery, flags::BATTERY),
    ] {
        if set {
            flag_byte |= bit;
        }
    }

    let gear = snapshot.gear.parse::<u8>().unwrap_or(0);

    [
        snapshot.speed,
        rpm_hi,
        rpm_lo,
        flag_byte,
        snapshot.fuel_percent.min(100),
        gear,
    ]
}

/// Map the raw gear byte to its display label
pub fn gear_label(raw: u8) -> String {
    if raw == 0 {
        NEUTRAL_GEAR.to_string()
    } else {
        raw.to_string()
    }
}

/// Decode `bytes`, keeping `previous` if the frame is malformed
pub fn apply_frame(previous: &TelemetrySnapshot, bytes: &[u8]) -> TelemetrySnapshot {
    decode(bytes).unwrap_or_else(|_| previous.clone())
}
