//! Configuration management module.

use chrono::NaiveDate;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::hj212::{FrameVariant, ReplyStyle, TimeoutSet};
use crate::models::{Reading, TelemetryRecord};

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing (first run).
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub handshake: HandshakeConfig,
    pub upload: UploadConfig,
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
}

/// Collection server endpoint and protocol-level fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Access password (PW), 6 digits.
    pub password: String,
    /// System type (ST).
    pub system_type: String,
    /// Command code (CN).
    pub command: String,
}

/// Per-phase deadlines in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub greeting_ms: u64,
    pub handshake_ack_ms: u64,
    pub write_ms: u64,
    pub response_ms: u64,
}

/// Vendor handshake behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub reply: ReplyStyle,
}

/// Frame variant selection and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub primary_variant: FrameVariant,
    pub fallback_enabled: bool,
    /// Whole-session retries after `ConnectionError` or `Timeout`.
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    /// Response size ceiling in bytes.
    pub response_ceiling: usize,
}

/// Static description of the monitored source and its device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub mn: String,
    pub ma: String,
    pub rno: String,
    pub xtype: String,
    pub original_activity: f64,
    pub current_activity: f64,
    /// Production date, `YYYYMMDD`.
    pub source_date: String,
    pub longitude: String,
    pub latitude: String,
    pub threshold: f64,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for daily rolling log files; console only when unset.
    pub dir: Option<PathBuf>,
}

impl AppConfig {
    /// Get config file path (platform config directory, else next to the executable).
    pub fn default_path() -> PathBuf {
        if let Some(dirs) = ProjectDirs::from("", "", "hj212-uplink") {
            return dirs.config_dir().join("config.toml");
        }
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => match config.validate() {
                    Ok(()) => ConfigLoadResult::Loaded(config),
                    Err(e) => ConfigLoadResult::Invalid(e),
                },
                Err(e) => ConfigLoadResult::Invalid(ConfigError::Parse(e)),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Validation("Server host cannot be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Server port must be greater than 0".to_string()));
        }
        if self.server.password.len() != 6 || !self.server.password.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Validation("Password must be 6 digits".to_string()));
        }
        if self.server.system_type.len() != 2 || !self.server.system_type.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Validation("System type (ST) must be 2 digits".to_string()));
        }
        if self.server.command.len() != 4 || !self.server.command.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Validation("Command code (CN) must be 4 digits".to_string()));
        }
        if self.timeouts.connect_ms == 0 {
            return Err(ConfigError::Validation("Connect timeout must be greater than 0".to_string()));
        }
        if self.timeouts.response_ms == 0 {
            return Err(ConfigError::Validation("Response timeout must be greater than 0".to_string()));
        }
        if self.upload.response_ceiling < 9 {
            return Err(ConfigError::Validation(
                "Response ceiling must hold at least a 9-byte status frame".to_string(),
            ));
        }

        // Device fields are checked against a placeholder reading.
        let placeholder = Reading {
            data_time: NaiveDate::from_ymd_opt(2000, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            dose_rate: 0.0,
            battery: 0.0,
            alert_type: 0,
            gps_valid: false,
            longitude: None,
            latitude: None,
        };
        let record = self
            .device
            .record_for(&placeholder)
            .map_err(|e| ConfigError::Validation(format!("Device: {e}")))?;
        record
            .validate()
            .map_err(|e| ConfigError::Validation(format!("Device: {e}")))?;
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl TimeoutConfig {
    /// Convert to the session's deadline set.
    pub fn to_timeout_set(&self) -> TimeoutSet {
        TimeoutSet {
            connect: Duration::from_millis(self.connect_ms),
            greeting: Duration::from_millis(self.greeting_ms),
            handshake_ack: Duration::from_millis(self.handshake_ack_ms),
            write: Duration::from_millis(self.write_ms),
            response: Duration::from_millis(self.response_ms),
        }
    }
}

impl DeviceConfig {
    /// Merge the static source description with one reading.
    pub fn record_for(&self, reading: &Reading) -> crate::Result<TelemetryRecord> {
        let source_date = NaiveDate::parse_from_str(&self.source_date, "%Y%m%d")
            .map_err(|e| crate::AppError::config(format!("Invalid source date '{}': {e}", self.source_date)))?;

        Ok(TelemetryRecord {
            mn: self.mn.clone(),
            ma: self.ma.clone(),
            rno: self.rno.clone(),
            xtype: self.xtype.clone(),
            original_activity: self.original_activity,
            current_activity: self.current_activity,
            source_date,
            data_time: reading.data_time,
            longitude: reading.longitude.clone().unwrap_or_else(|| self.longitude.clone()),
            latitude: reading.latitude.clone().unwrap_or_else(|| self.latitude.clone()),
            dose_rate: reading.dose_rate,
            threshold: self.threshold,
            alert_type: reading.alert_type,
            battery: reading.battery,
            gps_valid: reading.gps_valid,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "117.73.252.128".to_string(),
            port: 8091,
            password: "123456".to_string(),
            system_type: "61".to_string(),
            command: "3051".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            greeting_ms: 500,
            handshake_ack_ms: 1_000,
            write_ms: 5_000,
            response_ms: 5_000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            primary_variant: FrameVariant::WithLength,
            fallback_enabled: true,
            max_retries: 0,
            retry_interval_ms: 10_000,
            response_ceiling: 1024,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mn: "865229085145869".to_string(),
            ma: "002162".to_string(),
            rno: "DE25IR006722".to_string(),
            xtype: "02".to_string(),
            original_activity: 5.53e12,
            current_activity: 3.27e12,
            source_date: "20250703".to_string(),
            longitude: "12102.1465".to_string(),
            latitude: "3740.5073".to_string(),
            threshold: 100_000.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}
