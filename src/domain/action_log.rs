//! History of user actions, newest first

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;

pub const MAX_ACTION_ENTRIES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Connected,
    Disconnected,
    BlueScoreChange,
    RedScoreChange,
    Timer,
    ScoresReset,
    SettingsChanged,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::BlueScoreChange => "Blue Score",
            Self::RedScoreChange => "Red Score",
            Self::Timer => "Timer",
            Self::ScoresReset => "Reset",
            Self::SettingsChanged => "Settings",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionLogEntry {
    pub timestamp: DateTime<Local>,
    /// Hardware id of the scoreboard, "Unknown" when none was connected
    pub device_id: String,
    pub kind: ActionKind,
    pub description: String,
}

impl ActionLogEntry {
    pub fn formatted_time(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }
}

/// Newest-first history of user actions
#[derive(Debug, Clone)]
pub struct ActionLog {
    entries: VecDeque<ActionLogEntry>,
    capacity: usize,
}

impl Default for ActionLog {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_ACTION_ENTRIES),
            capacity: MAX_ACTION_ENTRIES,
        }
    }
}

impl ActionLog {
    pub fn record(&mut self, device_id: &str, kind: ActionKind, description: impl Into<String>) {
        self.entries.push_front(ActionLogEntry {
            timestamp: Local::now(),
            device_id: device_id.to_string(),
            kind,
            description: description.into(),
        });
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

    pub fn iter(&self) -> impl Iterator<Item = &ActionLogEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<ActionLogEntry> {
        self.entries.iter().cloned().collect()
    }
}
