use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// A known handshake packet replayed during negotiation
///
/// Typically captured with a BLE sniffer while the vendor app connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomAuthWrite {
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Devices
    #[serde(default)]
    pub known_device_ids: Vec<String>,
    #[serde(default)]
    pub last_connected_id: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    /// Only report scanned devices whose name contains this (case-insensitive)
    #[serde(default)]
    pub ble_name_filter: Option<String>,
    #[serde(default = "default_auth_key")]
    pub ble_auth_key: String,
    #[serde(default)]
    pub ble_custom_auth_writes: Vec<CustomAuthWrite>,
    #[serde(default = "default_connect_timeout_ms")]
    pub ble_connect_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub ble_discovery_timeout_ms: u64,
    #[serde(default = "default_first_frame_timeout_ms")]
    pub ble_first_frame_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub cache_catalog_layouts: bool,

    // Event Log
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    // Debug Settings
    /// Write every decoded frame to the Event Log
    #[serde(default = "default_false")]
    pub debug_raw_data_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_device_ids: Vec::new(),
            last_connected_id: None,
            log_settings: LogSettings::default(),

            ble_name_filter: None,
            ble_auth_key: default_auth_key(),
            ble_custom_auth_writes: Vec::new(),
            ble_connect_timeout_ms: default_connect_timeout_ms(),
            ble_discovery_timeout_ms: default_discovery_timeout_ms(),
            ble_first_frame_timeout_ms: default_first_frame_timeout_ms(),
            cache_catalog_layouts: default_true(),

            event_log_capacity: default_event_log_capacity(),

            debug_raw_data_logging: false,
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
    "bike_telemetry".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_auth_key() -> String {
    crate::infrastructure::bluetooth::protocol::DEFAULT_AUTH_KEY.to_string()
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_first_frame_timeout_ms() -> u64 {
    5_000
}
fn default_event_log_capacity() -> usize {
    crate::infrastructure::event_log::DEFAULT_CAPACITY
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults if unreadable
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BikeTelemetry");
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

    /// Remember a device that produced a live stream
    pub fn remember_device(&mut self, id: &str) -> anyhow::Result<()> {
        if !self.settings.known_device_ids.iter().any(|known| known == id) {
            self.settings.known_device_ids.push(id.to_string());
        }
        self.settings.last_connected_id = Some(id.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "ble_name_filter": "yezdi" }"#).unwrap();

        assert_eq!(settings.ble_name_filter.as_deref(), Some("yezdi"));
        assert_eq!(settings.ble_auth_key, "YEZDI_AUTH_DEFAULT");
        assert_eq!(settings.event_log_capacity, 200);
        assert_eq!(settings.log_settings.rotation, "daily");
        assert!(settings.cache_catalog_layouts);
    }

    #[test]
    fn test_remember_device_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::load(path.clone());
        service.remember_device("AA:BB").unwrap();
        service.remember_device("AA:BB").unwrap();

        let reloaded = SettingsService::load(path);
        assert_eq!(reloaded.get().known_device_ids, vec!["AA:BB".to_string()]);
        assert_eq!(reloaded.get().last_connected_id.as_deref(), Some("AA:BB"));
    }

    #[test]
    fn test_unreadable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let service = SettingsService::load(path);
        assert_eq!(service.get().ble_first_frame_timeout_ms, 5_000);
    }
}
