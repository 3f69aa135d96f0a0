//! Controller for a two-team BLE LED scoreboard.
//!
//! [`infrastructure::bluetooth::BluetoothService`] runs the connection
//! controller on a tokio task and hands back a
//! [`infrastructure::bluetooth::ControllerHandle`] plus a stream of
//! [`domain::models::AppEvent`]s. Any front end drives the scoreboard
//! through those two.

pub mod domain;
pub mod infrastructure;
