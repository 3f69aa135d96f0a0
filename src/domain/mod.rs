//! Domain layer: the scoreboard model, logs and user settings.
//!
//! Nothing here talks to Bluetooth.

pub mod action_log;
pub mod models;
pub mod scoreboard;
pub mod settings;
pub mod telemetry;
