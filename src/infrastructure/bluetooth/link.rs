//! Link Abstraction
//!
//! The capability the connection controller drives: scanning, connecting,
//! writing command packets and toggling telemetry notifications.
//!
//! Requests are fire-and-forget. Their outcomes, and everything else the
//! transport has to say, come back as [`LinkEvent`]s on a single channel so
//! the controller can handle them on one serialized path.

use crate::domain::models::DeviceId;
use crate::infrastructure::bluetooth::protocol::CommandPacket;
use std::fmt;
use uuid::Uuid;

/// Tag for one `Link::connect` request. Session events echo it back so
/// results of an abandoned attempt can be told apart from the current one.
pub type ConnectAttempt = u64;

/// Power / availability of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl TransportState {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// User-facing description of a fault, `None` when nothing is wrong
    pub fn fault_message(&self) -> Option<&'static str> {
        match self {
            Self::PoweredOn | Self::Unknown => None,
            Self::PoweredOff => Some("Bluetooth is turned off"),
            Self::Unauthorized => Some("Bluetooth access not authorized"),
            Self::Unsupported => Some("Bluetooth LE not supported on this device"),
            Self::Resetting => Some("Bluetooth is resetting"),
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Which notifying characteristic a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    Command,
    Telemetry,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Bluetooth is not available ({0})")]
    Unavailable(TransportState),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// Everything the transport reports back
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    TransportStateChanged(TransportState),
    Discovered {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    ScanFailed {
        reason: String,
    },
    Connected {
        id: DeviceId,
        attempt: ConnectAttempt,
    },
    ConnectFailed {
        id: DeviceId,
        attempt: ConnectAttempt,
        reason: String,
    },
    /// Service discovery finished after `Connected`
    CharacteristicsReady {
        id: DeviceId,
        attempt: ConnectAttempt,
        command: bool,
        telemetry: bool,
    },
    CharacteristicDiscoveryFailed {
        id: DeviceId,
        attempt: ConnectAttempt,
        reason: String,
    },
    /// `cause` is `None` for a requested disconnect, `Some` for a dropped link
    Disconnected {
        id: DeviceId,
        cause: Option<String>,
    },
    ValueUpdated {
        characteristic: CharacteristicKind,
        value: Vec<u8>,
    },
    WriteResult {
        result: Result<(), String>,
    },
    NotifyStateChanged {
        characteristic: CharacteristicKind,
        result: Result<bool, String>,
    },
}

/// Transport capability consumed by the controller
///
/// Implementations must not retry writes; retrying belongs to the controller.
pub trait Link: Send {
    fn start_scan(&mut self, service_filter: Uuid) -> Result<(), LinkError>;

    fn stop_scan(&mut self);

    /// Connect and resolve characteristics. Reports `Connected` followed by
    /// `CharacteristicsReady` (or a failure event), each tagged with `attempt`.
    /// A newer `connect` or any `disconnect` supersedes the attempt.
    fn connect(&mut self, device: &DeviceId, attempt: ConnectAttempt) -> Result<(), LinkError>;

    fn disconnect(&mut self, device: &DeviceId);

    /// Single write-with-response attempt on the command characteristic
    fn write_command(&mut self, packet: CommandPacket) -> Result<(), LinkError>;

    fn set_telemetry_notify(&mut self, enabled: bool) -> Result<(), LinkError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum LinkCall {
        StartScan(Uuid),
        StopScan,
        Connect(DeviceId, ConnectAttempt),
        Disconnect(DeviceId),
        Write(Vec<u8>),
        SetTelemetryNotify(bool),
    }

    /// Records every request; optionally rejects scans
    #[derive(Clone, Default)]
    pub struct MockLink {
        pub calls: Arc<Mutex<Vec<LinkCall>>>,
        pub reject_scan: bool,
        pub last_attempt: Arc<Mutex<ConnectAttempt>>,
    }

    impl MockLink {
        pub fn calls(&self) -> Vec<LinkCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    LinkCall::Write(bytes) => Some(bytes),
                    _ => None,
                })
                .collect()
        }

        /// Tag of the most recent connect request; survives `clear`
        pub fn last_attempt(&self) -> ConnectAttempt {
            *self.last_attempt.lock().unwrap()
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn push(&self, call: LinkCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Link for MockLink {
        fn start_scan(&mut self, service_filter: Uuid) -> Result<(), LinkError> {
            if self.reject_scan {
                return Err(LinkError::Backend("scan rejected".into()));
            }
            self.push(LinkCall::StartScan(service_filter));
            Ok(())
        }

        fn stop_scan(&mut self) {
            self.push(LinkCall::StopScan);
        }

        fn connect(&mut self, device: &DeviceId, attempt: ConnectAttempt) -> Result<(), LinkError> {
            *self.last_attempt.lock().unwrap() = attempt;
            self.push(LinkCall::Connect(device.clone(), attempt));
            Ok(())
        }

        fn disconnect(&mut self, device: &DeviceId) {
            self.push(LinkCall::Disconnect(device.clone()));
        }

        fn write_command(&mut self, packet: CommandPacket) -> Result<(), LinkError> {
            self.push(LinkCall::Write(packet.as_bytes().to_vec()));
            Ok(())
        }

        fn set_telemetry_notify(&mut self, enabled: bool) -> Result<(), LinkError> {
            self.push(LinkCall::SetTelemetryNotify(enabled));
            Ok(())
        }
    }
}
