//! Device health telemetry
//!
//! Entries are decoded from notifications on the telemetry characteristic
//! and kept newest-first in a bounded log.

use crate::infrastructure::bluetooth::protocol;
use chrono::{DateTime, Local};
use std::collections::VecDeque;

pub const MAX_TELEMETRY_ENTRIES: usize = 200;

/// Approximate thermal throttle point of the scoreboard MCU
pub const OVERHEAT_CELSIUS: f32 = 65.0;
/// Temperatures at or beyond this magnitude are sensor error markers (the firmware sends -999)
pub const SENSOR_ERROR_CELSIUS: f32 = 900.0;
pub const LOW_MEMORY_BYTES: u32 = 20_000;
pub const CRITICAL_MEMORY_BYTES: u32 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEntry {
    pub received_at: DateTime<Local>,
    pub sequence: u8,
    pub uptime_seconds: u16,
    pub temperature_celsius: f32,
    pub free_heap_bytes: u32,
    pub min_heap_bytes: u32,
    pub signal_dbm: i8,
    pub task_count: u8,
}

impl TelemetryEntry {
    pub fn is_overheating(&self) -> bool {
        self.temperature_celsius > OVERHEAT_CELSIUS
            && self.temperature_celsius < SENSOR_ERROR_CELSIUS
    }

    pub fn is_sensor_error(&self) -> bool {
        self.temperature_celsius.abs() >= SENSOR_ERROR_CELSIUS
    }

    pub fn is_low_memory(&self) -> bool {
        self.free_heap_bytes < LOW_MEMORY_BYTES
    }

    pub fn is_critical_memory(&self) -> bool {
        self.free_heap_bytes < CRITICAL_MEMORY_BYTES
    }

    pub fn formatted_time(&self) -> String {
        self.received_at.format("%H:%M:%S").to_string()
    }

    pub fn temperature_string(&self) -> String {
        if self.is_sensor_error() {
            return "N/A".to_string();
        }
        format!("{:.1}C", self.temperature_celsius)
    }

    pub fn free_heap_kb(&self) -> String {
        format!("{:.0}KB", self.free_heap_bytes as f32 / 1024.0)
    }

    pub fn min_heap_kb(&self) -> String {
        format!("{:.0}KB", self.min_heap_bytes as f32 / 1024.0)
    }

    pub fn uptime_string(&self) -> String {
        let hours = self.uptime_seconds / 3600;
        let minutes = (self.uptime_seconds % 3600) / 60;
        let seconds = self.uptime_seconds % 60;
        if hours > 0 {
            format!("{}h{:02}m", hours, minutes)
        } else if minutes > 0 {
            format!("{}m{:02}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

/// Newest-first ring of decoded telemetry
#[derive(Debug, Clone)]
pub struct TelemetryLog {
    entries: VecDeque<TelemetryEntry>,
    capacity: usize,
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::with_capacity(MAX_TELEMETRY_ENTRIES)
    }
}

impl TelemetryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Decode and record a notification. Malformed packets are dropped.
    pub fn on_notification(&mut self, bytes: &[u8]) -> Option<&TelemetryEntry> {
        let entry = protocol::decode_telemetry(bytes)?;
        self.push(entry);
        self.entries.front()
    }

    pub fn push(&mut self, entry: TelemetryEntry) {
        self.entries.push_front(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&TelemetryEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<TelemetryEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(sequence: u8, temperature: f32, free_heap: u32) -> Vec<u8> {
        let mut bytes = vec![protocol::TELEMETRY_MARKER, sequence, 0x3C, 0x00];
        bytes.extend_from_slice(&temperature.to_le_bytes());
        bytes.extend_from_slice(&free_heap.to_le_bytes());
        bytes.extend_from_slice(&free_heap.to_le_bytes());
        bytes.extend_from_slice(&[0xB0, 0x07, 0x00, 0x00]);
        bytes
    }

    fn entry(temperature: f32, free_heap: u32, uptime: u16) -> TelemetryEntry {
        let mut entry = protocol::decode_telemetry(&packet(0, temperature, free_heap)).unwrap();
        entry.uptime_seconds = uptime;
        entry
    }

    #[test]
    fn test_log_keeps_newest_200() {
        let mut log = TelemetryLog::default();
        for seq in 0..205u32 {
            log.on_notification(&packet(seq as u8, 30.0, 50_000));
        }

        assert_eq!(log.len(), MAX_TELEMETRY_ENTRIES);
        assert_eq!(log.latest().unwrap().sequence, 204);
        // sequences 0..=4 were evicted first
        let oldest = log.iter().last().unwrap();
        assert_eq!(oldest.sequence, 5);
        let sequences: Vec<u8> = log.iter().map(|e| e.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] == w[1] + 1));
    }

    #[test]
    fn test_malformed_notifications_are_dropped() {
        let mut log = TelemetryLog::default();
        assert!(log.on_notification(&[0x04, 0x01]).is_none());
        let mut bad = packet(1, 30.0, 50_000);
        bad[0] = 0x03;
        assert!(log.on_notification(&bad).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut log = TelemetryLog::default();
        log.on_notification(&packet(1, 30.0, 50_000));
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_thresholds() {
        assert!(entry(65.5, 50_000, 0).is_overheating());
        assert!(!entry(65.0, 50_000, 0).is_overheating());
        assert!(!entry(950.0, 50_000, 0).is_overheating());
        assert!(entry(-999.0, 50_000, 0).is_sensor_error());

        let low = entry(30.0, 15_000, 0);
        assert!(low.is_low_memory());
        assert!(!low.is_critical_memory());
        assert!(entry(30.0, 9_999, 0).is_critical_memory());
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(entry(25.5, 50_000, 0).temperature_string(), "25.5C");
        assert_eq!(entry(-999.0, 50_000, 0).temperature_string(), "N/A");
        assert_eq!(entry(25.0, 20_480, 0).free_heap_kb(), "20KB");
        assert_eq!(entry(25.0, 50_000, 42).uptime_string(), "42s");
        assert_eq!(entry(25.0, 50_000, 125).uptime_string(), "2m05s");
        assert_eq!(entry(25.0, 50_000, 3_720).uptime_string(), "1h02m");
    }
}
