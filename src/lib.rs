//! Bike Telemetry
//!
//! Links to a motorcycle instrument cluster over Bluetooth LE, negotiates
//! access to its telemetry stream and decodes each frame into a
//! [`TelemetrySnapshot`](domain::models::TelemetrySnapshot).
//!
//! The dashboard, settings screens and any other presentation layer sit on
//! top of [`BluetoothService`](infrastructure::bluetooth::BluetoothService).

pub mod domain;
pub mod infrastructure;
