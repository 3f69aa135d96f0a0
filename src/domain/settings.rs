use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "scoreboard_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Score Controls
    #[serde(default = "default_score_increment")]
    pub score_increment: u8,
    #[serde(default = "default_false")]
    pub slow_update_rate: bool,
    #[serde(default)]
    pub last_connected_id: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub ble_command_char_uuid: String,
    #[serde(default = "default_telemetry_uuid")]
    pub ble_telemetry_char_uuid: String,

    // Timing
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_retry_count")]
    pub write_retry_count: u32,
    #[serde(default = "default_write_retry_base_ms")]
    pub write_retry_base_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            score_increment: default_score_increment(),
            slow_update_rate: false,
            last_connected_id: None,
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_command_char_uuid: default_command_uuid(),
            ble_telemetry_char_uuid: default_telemetry_uuid(),

            scan_timeout_secs: default_scan_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            write_retry_count: default_write_retry_count(),
            write_retry_base_ms: default_write_retry_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

fn default_score_increment() -> u8 {
    1
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::COMMAND_CHAR_UUID.to_string()
}
fn default_telemetry_uuid() -> String {
    protocol::TELEMETRY_CHAR_UUID.to_string()
}
fn default_scan_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_write_retry_count() -> u32 {
    3
}
fn default_write_retry_base_ms() -> u64 {
    100
}
fn default_max_reconnect_attempts() -> u32 {
    3
}

/// Score increment presets per sport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SportPreset {
    Generic,
    Basketball,
    Basketball3pt,
    FootballTd,
    FootballTdXp,
    Rugby,
    RugbyConverted,
    Soccer,
}

impl SportPreset {
    pub const ALL: [SportPreset; 8] = [
        Self::Generic,
        Self::Basketball,
        Self::Basketball3pt,
        Self::FootballTd,
        Self::FootballTdXp,
        Self::Rugby,
        Self::RugbyConverted,
        Self::Soccer,
    ];

    pub fn increment(&self) -> u8 {
        match self {
            Self::Generic | Self::Soccer => 1,
            Self::Basketball => 2,
            Self::Basketball3pt => 3,
            Self::Rugby => 5,
            Self::FootballTd => 6,
            Self::FootballTdXp | Self::RugbyConverted => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Generic => "Generic",
            Self::Basketball => "Basketball",
            Self::Basketball3pt => "Basketball 3pt",
            Self::FootballTd => "Football TD",
            Self::FootballTdXp => "Football TD+XP",
            Self::Rugby => "Rugby Try",
            Self::RugbyConverted => "Rugby Conv.",
            Self::Soccer => "Soccer/Hockey",
        }
    }

    pub fn short_label(&self) -> String {
        format!("+{}", self.increment())
    }
}

/// Key-value access to persisted preferences
pub trait SettingsStore {
    fn load_setting(&self, key: &str) -> Option<serde_json::Value>;
    fn save_setting(&mut self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ScoreboardRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn set_last_connected_id(&mut self, hardware_id: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_id.as_deref() != Some(hardware_id) {
            self.settings.last_connected_id = Some(hardware_id.to_string());
            self.save()?;
        }
        Ok(())
    }

    pub fn apply_preset(&mut self, preset: SportPreset) -> anyhow::Result<()> {
        self.settings.score_increment = preset.increment();
        self.save()
    }
}

impl SettingsStore for SettingsService {
    fn load_setting(&self, key: &str) -> Option<serde_json::Value> {
        let document = serde_json::to_value(&self.settings).ok()?;
        document.get(key).cloned()
    }

    fn save_setting(&mut self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut document = serde_json::to_value(&self.settings)?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("Settings document is not an object"))?;
        if !object.contains_key(key) {
            anyhow::bail!("Unknown setting '{}'", key);
        }
        object.insert(key.to_string(), value);
        self.settings = serde_json::from_value(document)?;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::from_path(dir.path().join("settings.json"));
        assert_eq!(service.get().score_increment, 1);
        assert_eq!(service.get().write_retry_count, 3);
        assert_eq!(service.get().write_retry_base_ms, 100);
        assert_eq!(service.get().scan_timeout_secs, 10);
        assert!(service.get().last_connected_id.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "score_increment": 3 }"#).unwrap();

        let service = SettingsService::from_path(path);
        assert_eq!(service.get().score_increment, 3);
        assert_eq!(
            service.get().ble_command_char_uuid,
            protocol::COMMAND_CHAR_UUID.to_string()
        );
    }

    #[test]
    fn test_save_setting_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        service
            .save_setting("last_connected_id", serde_json::json!("A1B2"))
            .unwrap();
        service.apply_preset(SportPreset::Rugby).unwrap();

        let reloaded = SettingsService::from_path(path);
        assert_eq!(
            reloaded.load_setting("last_connected_id"),
            Some(serde_json::json!("A1B2"))
        );
        assert_eq!(reloaded.get().score_increment, 5);
    }

    #[test]
    fn test_save_setting_rejects_unknown_or_mistyped() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = SettingsService::from_path(dir.path().join("settings.json"));
        assert!(service.save_setting("no_such_key", serde_json::json!(1)).is_err());
        assert!(service
            .save_setting("score_increment", serde_json::json!("lots"))
            .is_err());
        assert_eq!(service.get().score_increment, 1);
    }

    #[test]
    fn test_sport_presets() {
        assert_eq!(SportPreset::Basketball3pt.increment(), 3);
        assert_eq!(SportPreset::FootballTdXp.short_label(), "+7");
        assert_eq!(SportPreset::ALL.len(), 8);
    }
}
