//! Bluetooth Module
//!
//! Links to the bike's instrument cluster and turns its notifications into
//! telemetry snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Owning context - public API for collaborators)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection  │  │ Protocol │
//! │           │  │             │  │          │
//! │ - BLE     │  │ - Catalog   │  │ - Frame  │
//! │ discovery │  │ - Negotiator│  │  decode  │
//! └─────┬─────┘  └──────┬──────┘  └──────────┘
//!       └───────┬───────┘
//!               ▼
//!        ┌─────────────┐
//!        │  Transport  │  btleplug backend / simulated backend
//!        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Telemetry frame layout, decoding and encoding
//! - [`catalog`] - Discovered services/characteristics and capability lookup
//! - [`negotiator`] - Ordered authentication strategy chain
//! - [`connection`] - One link's lifecycle: connect, discover, negotiate, stream
//! - [`session_state`] - Shared state guarded by the session identifier
//! - [`scanner`] - BLE device discovery
//! - [`transport`] - Radio abstraction implemented by the backends
//! - [`btleplug_backend`] - Real radio via btleplug
//! - [`simulated`] - In-process peripherals for tests and demos
//! - [`service`] - Main service coordinator

pub mod btleplug_backend;
pub mod catalog;
pub mod connection;
pub mod negotiator;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session_state;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::BluetoothService;
