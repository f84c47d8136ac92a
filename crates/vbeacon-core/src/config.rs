//! Beacon configuration management.
//!
//! Handles loading, saving, and validating the vbeacon configuration:
//! - Beacon identity (organization UUID, major/minor, tx power)
//! - Session length and proximity threshold
//! - Scan tuning and adapter selection
//! - Alarm command
//!
//! The file is TOML. Any key can be overridden from the environment as
//! `VBEACON__<SECTION>__<KEY>`, e.g. `VBEACON__MONITOR__PROXIMITY_THRESHOLD_RSSI=-70`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::codec::APPLE_COMPANY_ID;
use crate::platform::AdvertisingType;
use crate::scanner::{DEFAULT_BATCH_SIZE, DEFAULT_POLL_TIMEOUT};
use crate::service::ServiceConfig;
use crate::types::BeaconIdentity;

/// Organization UUID used when none is configured.
pub const DEFAULT_ORGANIZATION_ID: Uuid = Uuid::from_u128(0x2f23_4454_cf6d_4a0f_adf2_f491_1ba9_ffa6);

/// Weakest threshold accepted, in dBm.
pub const MIN_THRESHOLD_RSSI: i16 = -127;

/// Strongest threshold accepted, in dBm.
pub const MAX_THRESHOLD_RSSI: i16 = 0;

/// Longest accepted scan poll timeout, in milliseconds.
pub const MAX_POLL_TIMEOUT_MS: u64 = 1000;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "VBEACON";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A field holds an invalid value.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Dotted field path, e.g. `monitor.on_duration_secs`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// What this device broadcasts.
    pub beacon: BeaconConfig,
    /// Session length and alarm threshold.
    pub monitor: MonitorConfig,
    /// Scan loop tuning.
    pub scan: ScanConfig,
    /// Alarm output.
    pub alarm: AlarmConfig,
}

/// Beacon identity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Organization UUID shared by all beacons in the deployment.
    pub uuid: Uuid,
    /// Major number of this device.
    pub major: u16,
    /// Minor number of this device.
    pub minor: u16,
    /// Calibrated transmit power at 1 m, in dBm.
    pub tx_power: i8,
    /// Company identifier for the manufacturer data.
    pub company_id: u16,
    /// How the advertisement is presented.
    pub advertising_type: AdvertisingType,
    /// Human-readable device name.
    pub name: Option<String>,
    /// Organization name.
    pub org: Option<String>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            uuid: DEFAULT_ORGANIZATION_ID,
            major: 0,
            minor: 0,
            tx_power: -77,
            company_id: APPLE_COMPANY_ID,
            advertising_type: AdvertisingType::Peripheral,
            name: None,
            org: None,
        }
    }
}

/// Session and threshold configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How many one-second ticks a session lasts.
    pub on_duration_secs: u64,
    /// Peers with RSSI strictly above this are too close.
    /// Typical values: -70 (far) to -40 (very close).
    pub proximity_threshold_rssi: i16,
    /// Ignore sightings older than this. Unset keeps every sighting for the
    /// whole session.
    pub stale_after_secs: Option<u64>,
    /// Seconds from session start until the next wake-up.
    pub wake_time_secs: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            on_duration_secs: 60,
            proximity_threshold_rssi: -60,
            stale_after_secs: None,
            wake_time_secs: None,
        }
    }
}

/// Scan loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Adapter name such as `hci0`. Unset uses the default adapter.
    pub adapter: Option<String>,
    /// How long one poll waits for records, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Maximum records pulled per poll.
    pub batch_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            poll_timeout_ms: u64::try_from(DEFAULT_POLL_TIMEOUT.as_millis()).unwrap_or(10),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ScanConfig {
    /// Poll timeout as a [`Duration`].
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Alarm configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AlarmConfig {
    /// Command line spawned on each alarm. Unset only logs.
    pub command: Option<String>,
}

impl Config {
    /// Load and validate configuration from `path`, applying environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::load_from(path.as_ref(), None)
    }

    /// Like [`Config::load`], but overrides come from `env` instead of the
    /// process environment.
    ///
    /// Keys use the same `VBEACON__SECTION__KEY` form.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails
    /// validation.
    pub fn load_with_env(
        path: impl AsRef<Path>,
        env: HashMap<String, String>,
    ) -> ConfigResult<Self> {
        Self::load_from(path.as_ref(), Some(env))
    }

    fn load_from(path: &Path, env: Option<HashMap<String, String>>) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or fall back to defaults when the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        match Self::load(path.as_ref()) {
            Err(ConfigError::NotFound(missing)) => {
                info!(path = %missing, "No configuration file; using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Write the configuration to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Default configuration file path.
    ///
    /// On Raspberry Pi: `/etc/vbeacon/config.toml`.
    /// For development: the platform config dir.
    #[must_use]
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/vbeacon/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "vbeacon").map_or_else(
                || PathBuf::from("./config.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single error, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: String| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            });
        };

        if self.beacon.uuid.is_nil() {
            invalid("beacon.uuid", "must not be the nil UUID".to_string());
        }
        if self.monitor.on_duration_secs == 0 {
            invalid("monitor.on_duration_secs", "must be at least 1".to_string());
        }
        if !(MIN_THRESHOLD_RSSI..=MAX_THRESHOLD_RSSI).contains(&self.monitor.proximity_threshold_rssi)
        {
            invalid(
                "monitor.proximity_threshold_rssi",
                format!(
                    "must be between {MIN_THRESHOLD_RSSI} and {MAX_THRESHOLD_RSSI} dBm (got {})",
                    self.monitor.proximity_threshold_rssi
                ),
            );
        }
        if self.monitor.stale_after_secs == Some(0) {
            invalid("monitor.stale_after_secs", "must be at least 1 when set".to_string());
        }
        if !(1..=MAX_POLL_TIMEOUT_MS).contains(&self.scan.poll_timeout_ms) {
            invalid(
                "scan.poll_timeout_ms",
                format!(
                    "must be between 1 and {MAX_POLL_TIMEOUT_MS} (got {})",
                    self.scan.poll_timeout_ms
                ),
            );
        }
        if self.scan.batch_size == 0 {
            invalid("scan.batch_size", "must be at least 1".to_string());
        }
        if matches!(&self.scan.adapter, Some(adapter) if adapter.trim().is_empty()) {
            invalid("scan.adapter", "must not be empty when set".to_string());
        }
        if matches!(&self.alarm.command, Some(command) if command.trim().is_empty()) {
            invalid("alarm.command", "must not be empty when set".to_string());
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// The identity this device broadcasts.
    #[must_use]
    pub const fn identity(&self) -> BeaconIdentity {
        BeaconIdentity::new(
            self.beacon.uuid,
            self.beacon.major,
            self.beacon.minor,
            self.beacon.tx_power,
        )
    }

    /// Session parameters for [`crate::BeaconService`].
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(
            self.identity(),
            self.monitor.on_duration_secs,
            self.monitor.proximity_threshold_rssi,
        )
        .with_stale_after(self.monitor.stale_after_secs.map(Duration::from_secs))
        .with_wake_time_secs(self.monitor.wake_time_secs)
    }
}
