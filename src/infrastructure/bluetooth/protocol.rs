//! Scoreboard Wire Protocol
//!
//! This module contains the packet formats exchanged with the scoreboard
//! firmware: the 5-byte command packet written by the client and the
//! 20-byte telemetry packet notified by the device.

use crate::domain::telemetry::TelemetryEntry;
use anyhow::Result;
use chrono::{DateTime, Local};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use tracing::trace;
use uuid::Uuid;

/// Scoreboard BLE Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7B5E4A8C_2D1F_4E3B_9A6C_8F0D1E2C3B4A);

/// Command Characteristic UUID - where score/timer packets are written
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x7B5E4A8C_2D1F_4E3B_9A6C_8F0D1E2C3B4B);

/// Telemetry Characteristic UUID - device health notifications
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0x7B5E4A8C_2D1F_4E3B_9A6C_8F0D1E2C3B4C);

pub const COMMAND_PACKET_SIZE: usize = 5;
pub const TELEMETRY_PACKET_SIZE: usize = 20;

/// First byte of a full-status telemetry packet
pub const TELEMETRY_MARKER: u8 = 0x04;

pub const MAX_SCORE: u8 = 99;
pub const MAX_TIMER_MINUTES: u8 = 99;
pub const MAX_TIMER_SECONDS: u8 = 59;

/// Byte offsets inside the command packet
pub mod command_index {
    pub const BLUE_SCORE: usize = 0;
    pub const RED_SCORE: usize = 1;
    pub const TIMER_MINUTES: usize = 2;
    pub const TIMER_SECONDS: usize = 3;
    pub const FLAGS: usize = 4;
}

/// Flags byte of the command packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u8);

impl CommandFlags {
    /// bit 0: device uses the slow update cadence
    pub const SLOW_UPDATE_RATE: Self = Self(0x01);
    /// bit 1: repaint every display segment
    pub const FORCE_REDRAW: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x03)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommandFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A 5-byte command packet, always well-formed
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket([u8; COMMAND_PACKET_SIZE]);

impl CommandPacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn blue_score(&self) -> u8 {
        self.0[command_index::BLUE_SCORE]
    }

    pub fn red_score(&self) -> u8 {
        self.0[command_index::RED_SCORE]
    }

    pub fn timer_minutes(&self) -> u8 {
        self.0[command_index::TIMER_MINUTES]
    }

    pub fn timer_seconds(&self) -> u8 {
        self.0[command_index::TIMER_SECONDS]
    }

    pub fn flags(&self) -> CommandFlags {
        CommandFlags::from_bits_truncate(self.0[command_index::FLAGS])
    }
}

impl fmt::Debug for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandPacket({:02X?})", self.0)
    }
}

impl From<CommandPacket> for Vec<u8> {
    fn from(packet: CommandPacket) -> Self {
        packet.0.to_vec()
    }
}

/// Wrap a score into 0-99. A score of 150 encodes as 50; this is intentional.
pub fn wrap_score(value: u32) -> u8 {
    (value % 100) as u8
}

/// Build a command packet
///
/// # Command Packet Structure (5 bytes)
///
/// ```text
/// [0] : Blue score     (value mod 100)
/// [1] : Red score      (value mod 100)
/// [2] : Timer minutes  (clamped to 0-99, 0 in score-only mode)
/// [3] : Timer seconds  (clamped to 0-59)
/// [4] : Flags
///       bit 0: slow update cadence
///       bit 1: force full redraw
/// ```
///
/// Scores wrap while timer fields clamp. Never fails.
pub fn encode_command(
    blue_score: u32,
    red_score: u32,
    timer_minutes: u32,
    timer_seconds: u32,
    flags: CommandFlags,
) -> CommandPacket {
    let mut bytes = [0u8; COMMAND_PACKET_SIZE];
    bytes[command_index::BLUE_SCORE] = wrap_score(blue_score);
    bytes[command_index::RED_SCORE] = wrap_score(red_score);
    bytes[command_index::TIMER_MINUTES] = timer_minutes.min(MAX_TIMER_MINUTES as u32) as u8;
    bytes[command_index::TIMER_SECONDS] = timer_seconds.min(MAX_TIMER_SECONDS as u32) as u8;
    bytes[command_index::FLAGS] = flags.bits();
    CommandPacket(bytes)
}

/// Parse a 20-byte telemetry packet from the scoreboard
///
/// # Telemetry Packet Structure (20 bytes, little-endian)
///
/// ```text
/// [0]     : Marker (0x04 = full status)
/// [1]     : Sequence number (wraps at 255)
/// [2-3]   : Uptime seconds (u16)
/// [4-7]   : Temperature in Celsius (f32)
/// [8-11]  : Free heap bytes (u32)
/// [12-15] : Minimum free heap since boot (u32)
/// [16]    : Signal strength dBm (i8)
/// [17]    : Task count (u8)
/// [18-19] : Reserved
/// ```
///
/// Returns `None` for short packets and for any other marker.
pub fn decode_telemetry(bytes: &[u8]) -> Option<TelemetryEntry> {
    decode_telemetry_at(bytes, Local::now())
}

pub fn decode_telemetry_at(bytes: &[u8], received_at: DateTime<Local>) -> Option<TelemetryEntry> {
    if bytes.len() < TELEMETRY_PACKET_SIZE {
        trace!("Dropping short telemetry packet ({} bytes)", bytes.len());
        return None;
    }
    if bytes[0] != TELEMETRY_MARKER {
        trace!("Dropping telemetry packet with marker {:#04X}", bytes[0]);
        return None;
    }

    #[cfg(debug_assertions)]
    trace!("Raw telemetry packet: {:02X?}", &bytes[..TELEMETRY_PACKET_SIZE]);

    Some(TelemetryEntry {
        received_at,
        sequence: bytes[1],
        uptime_seconds: u16::from_le_bytes([bytes[2], bytes[3]]),
        temperature_celsius: f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        free_heap_bytes: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        min_heap_bytes: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        signal_dbm: bytes[16] as i8,
        task_count: bytes[17],
    })
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}
