use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::adb::paths::validate_device_path;
use crate::app::error::AppError;
use crate::app::models::LogFormat;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    /// Explicit adb executable. Empty means "derive from sdk_root, then PATH".
    pub adb_path: String,
    pub sdk_root: String,
    pub ndk_root: String,
    pub command_timeout_sec: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            sdk_root: String::new(),
            ndk_root: String::new(),
            command_timeout_sec: 10,
        }
    }
}

impl ToolSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherSettings {
    pub shutdown_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 3_000,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub refresh_interval_sec: u64,
    pub default_port: u16,
    /// Lower-cased prefixes of `adb connect` output that mean failure even
    /// when adb exits with status 0.
    pub connect_failure_prefixes: Vec<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            refresh_interval_sec: 2,
            default_port: 5555,
            connect_failure_prefixes: vec![
                "failed to connect".to_string(),
                "cannot connect".to_string(),
                "unable to connect".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogcatSettings {
    pub format: LogFormat,
    pub max_entries: usize,
    pub buffers: Vec<String>,
}

impl Default for LogcatSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Threadtime,
            max_entries: 60_000,
            buffers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenRecordSettings {
    pub bit_rate: String,
    pub size: String,
    pub time_limit_sec: u64,
    pub remote_dir: String,
    pub stop_timeout_ms: u64,
    pub finalize_delay_ms: u64,
}

impl Default for ScreenRecordSettings {
    fn default() -> Self {
        Self {
            bit_rate: String::new(),
            size: String::new(),
            time_limit_sec: 0,
            remote_dir: "/sdcard".to_string(),
            stop_timeout_ms: 5_000,
            finalize_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotSettings {
    pub remote_dir: String,
    pub display_id: i32,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            remote_dir: "/sdcard".to_string(),
            display_id: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub logcat: LogcatSettings,
    #[serde(default)]
    pub screen_record: ScreenRecordSettings,
    #[serde(default)]
    pub screenshot: ScreenshotSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub output_path: String,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LAZY_GREENTEA_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lazy_greentea_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_config_path(&path))
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::config(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.tools.command_timeout_sec == 0 {
        config.tools.command_timeout_sec = 10;
    }
    if config.dispatcher.shutdown_timeout_ms < 100 {
        config.dispatcher.shutdown_timeout_ms = 3_000;
    }
    if config.dispatcher.poll_interval_ms == 0 {
        config.dispatcher.poll_interval_ms = 10;
    }
    if config.device.default_port == 0 {
        config.device.default_port = 5555;
    }
    config.device.connect_failure_prefixes = config
        .device
        .connect_failure_prefixes
        .iter()
        .map(|prefix| prefix.trim().to_lowercase())
        .filter(|prefix| !prefix.is_empty())
        .collect();
    if config.device.connect_failure_prefixes.is_empty() {
        config.device.connect_failure_prefixes = DeviceSettings::default().connect_failure_prefixes;
    }
    if config.logcat.max_entries < 100 {
        config.logcat.max_entries = 60_000;
    }
    if validate_device_path(&config.screen_record.remote_dir).is_err() {
        config.screen_record.remote_dir = "/sdcard".to_string();
    }
    if config.screen_record.stop_timeout_ms < 100 {
        config.screen_record.stop_timeout_ms = 5_000;
    }
    if validate_device_path(&config.screenshot.remote_dir).is_err() {
        config.screenshot.remote_dir = "/sdcard".to_string();
    }
    config
}
