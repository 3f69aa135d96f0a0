//! Bluetooth Module
//!
//! Provides BLE communication with the scoreboard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            BluetoothService / ControllerHandle          │
//! │   (single task: commands, link events, deadlines)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!              ┌─────────────────┐       ┌──────────┐
//!              │   Connection    │──────▶│ Protocol │
//!              │ (state machine, │       │ - UUIDs  │
//!              │  write retries) │       │ - Packets│
//!              └────────┬────────┘       └──────────┘
//!                       │ Link trait / LinkEvent
//!                       ▼
//!              ┌─────────────────┐
//!              │    BtleLink     │
//!              │   (btleplug)    │
//!              └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command packet encoding, telemetry decoding
//! - [`link`] - Transport capability and the events it reports
//! - [`connection`] - Connection lifecycle, handshake, retries, reconnects
//! - [`service`] - Task that drives the controller
//! - [`btle`] - btleplug implementation of the link

pub mod btle;
pub mod connection;
pub mod link;
pub mod protocol;
pub mod service;

// Re-export main service for convenience
pub use service::{BluetoothService, ControllerHandle};
