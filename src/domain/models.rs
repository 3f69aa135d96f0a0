//! Shared types passed between the controller and its consumers

use crate::domain::action_log::ActionLogEntry;
use crate::domain::scoreboard::ScoreboardState;
use crate::domain::telemetry::TelemetryEntry;
use std::fmt;

/// Placeholder hardware id used when the advertised name is missing or too short
pub const UNKNOWN_HARDWARE_ID: &str = "????";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Scanning...",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting...",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Team side on the scoreboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Blue,
    Red,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blue => f.write_str("Blue"),
            Self::Red => f.write_str("Red"),
        }
    }
}

/// Transport-level unique identity of a peripheral
///
/// On macOS / Windows this is a UUID string, on Linux a MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Categorized signal strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStrength {
    Strong,
    Good,
    Weak,
    VeryWeak,
}

impl SignalStrength {
    /// Map a raw RSSI reading (dBm) onto a tier
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -50 => Self::Strong,
            r if r >= -70 => Self::Good,
            r if r >= -85 => Self::Weak,
            _ => Self::VeryWeak,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Strong => "Strong",
            Self::Good => "Good",
            Self::Weak => "Weak",
            Self::VeryWeak => "Very Weak",
        }
    }
}

/// A scoreboard found during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub hardware_id: String,
    pub rssi: i16,
}

impl DiscoveredDevice {
    pub fn new(id: DeviceId, advertised_name: Option<&str>, rssi: i16) -> Self {
        Self {
            id,
            hardware_id: extract_hardware_id(advertised_name),
            rssi,
        }
    }

    pub fn signal_strength(&self) -> SignalStrength {
        SignalStrength::from_rssi(self.rssi)
    }
}

/// Take the last 4 characters of an advertised name such as "Scoreboard A1B2"
pub fn extract_hardware_id(name: Option<&str>) -> String {
    match name {
        Some(name) if name.chars().count() >= 4 => {
            let skip = name.chars().count() - 4;
            name.chars().skip(skip).collect()
        }
        _ => UNKNOWN_HARDWARE_ID.to_string(),
    }
}

/// Consumer-facing operations routed to the controller task
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect,
    IncrementScore(Side, u8),
    DecrementScore(Side),
    SetScore(Side, u8),
    StartTimer { minutes: u8, seconds: u8 },
    StopTimer,
    ResetScores,
    SetTelemetryEnabled(bool),
    ClearTelemetryLog,
    ClearActionLog,
    SetSlowUpdateRate(bool),
}

/// Read-only view of everything the controller owns
#[derive(Debug, Clone, Default)]
pub struct ControllerSnapshot {
    pub status: ConnectionStatus,
    pub state: ScoreboardState,
    pub discovered_devices: Vec<DiscoveredDevice>,
    pub connected_device: Option<DiscoveredDevice>,
    pub last_error: Option<String>,
    pub telemetry_enabled: bool,
    pub telemetry: Vec<TelemetryEntry>,
    pub actions: Vec<ActionLogEntry>,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    DeviceFound(DiscoveredDevice),
    StateChanged(ScoreboardState),
    Telemetry(TelemetryEntry),
    PacketSent { write_id: u64, success: bool },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_id_takes_last_four_chars() {
        assert_eq!(extract_hardware_id(Some("Scoreboard A1B2")), "A1B2");
        assert_eq!(extract_hardware_id(Some("WXYZ")), "WXYZ");
    }

    #[test]
    fn test_hardware_id_placeholder() {
        assert_eq!(extract_hardware_id(Some("abc")), "????");
        assert_eq!(extract_hardware_id(Some("")), "????");
        assert_eq!(extract_hardware_id(None), "????");
    }

    #[test]
    fn test_signal_strength_tiers() {
        assert_eq!(SignalStrength::from_rssi(-30), SignalStrength::Strong);
        assert_eq!(SignalStrength::from_rssi(-50), SignalStrength::Strong);
        assert_eq!(SignalStrength::from_rssi(-51), SignalStrength::Good);
        assert_eq!(SignalStrength::from_rssi(-70), SignalStrength::Good);
        assert_eq!(SignalStrength::from_rssi(-71), SignalStrength::Weak);
        assert_eq!(SignalStrength::from_rssi(-85), SignalStrength::Weak);
        assert_eq!(SignalStrength::from_rssi(-86), SignalStrength::VeryWeak);
    }
}
