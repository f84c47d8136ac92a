//! Unified error types for the vbeacon core library.
//!
//! [`BeaconError`] covers every failure that can end a beacon session. Each
//! module also has its own specific error type (`AdvertiserError`,
//! `ScanError`, `CodecError`, `ConfigError`) that converts into it.
//!
//! The variants are grouped so a caller can tell "could not advertise" from
//! "could not scan" from "bad configuration" and decide whether to retry or
//! power down.
//!
//! # Example
//!
//! ```rust
//! use vbeacon_core::error::{BeaconError, Result};
//!
//! fn require_adapter(found: bool) -> Result<()> {
//!     if !found {
//!         return Err(BeaconError::AdvertiserAdapterNotFound);
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_adapter(false).unwrap_err().is_advertiser_error());
//! ```

use thiserror::Error;

use crate::advertiser::AdvertiserError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::scanner::ScanError;

/// The unified error type for all vbeacon operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    // =========================================================================
    // ADVERTISING ERRORS
    // =========================================================================
    /// No Bluetooth adapter with advertising support was found.
    #[error(
        "Could not advertise: no Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    AdvertiserAdapterNotFound,

    /// The platform rejected the advertisement.
    #[error("Could not advertise: {0}")]
    AdvertisingFailed(String),

    /// A broadcast was started twice.
    #[error("Advertiser is already running")]
    AlreadyAdvertising,

    // =========================================================================
    // SCANNING ERRORS
    // =========================================================================
    /// The radio could not be opened for scanning.
    #[error("Could not scan: {0}")]
    ScanAdapterError(String),

    /// A scan session was started twice.
    #[error("Scanner is already running")]
    AlreadyScanning,

    // =========================================================================
    // RECORD ERRORS
    // =========================================================================
    /// A received advertisement could not be decoded.
    #[error("Malformed advertisement: {0}")]
    MalformedRecord(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found.
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(String),

    /// The configuration could not be read, parsed or written.
    #[error("Failed to load configuration: {0}")]
    ConfigParseError(String),

    /// The configuration contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

/// A specialized [`Result`] type for vbeacon operations.
pub type Result<T> = std::result::Result<T, BeaconError>;

impl BeaconError {
    /// Returns `true` if the beacon could not start advertising.
    #[inline]
    #[must_use]
    pub const fn is_advertiser_error(&self) -> bool {
        matches!(
            self,
            Self::AdvertiserAdapterNotFound | Self::AdvertisingFailed(_) | Self::AlreadyAdvertising
        )
    }

    /// Returns `true` if the beacon could not start scanning.
    #[inline]
    #[must_use]
    pub const fn is_scan_error(&self) -> bool {
        matches!(self, Self::ScanAdapterError(_) | Self::AlreadyScanning)
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if retrying the session later may succeed without
    /// changing anything.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AdvertisingFailed(_) | Self::ScanAdapterError(_) | Self::MalformedRecord(_)
        )
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AdvertiserAdapterNotFound => "ADVERTISER_ADAPTER_NOT_FOUND",
            Self::AdvertisingFailed(_) => "ADVERTISING_FAILED",
            Self::AlreadyAdvertising => "ALREADY_ADVERTISING",
            Self::ScanAdapterError(_) => "SCAN_ADAPTER_ERROR",
            Self::AlreadyScanning => "ALREADY_SCANNING",
            Self::MalformedRecord(_) => "MALFORMED_RECORD",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<AdvertiserError> for BeaconError {
    fn from(err: AdvertiserError) -> Self {
        match err {
            AdvertiserError::AdapterNotFound => Self::AdvertiserAdapterNotFound,
            AdvertiserError::AlreadyAdvertising => Self::AlreadyAdvertising,
            AdvertiserError::RegistrationRejected { .. } | AdvertiserError::Internal { .. } => {
                Self::AdvertisingFailed(err.to_string())
            }
        }
    }
}

impl From<ScanError> for BeaconError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::AlreadyScanning => Self::AlreadyScanning,
            ScanError::AdapterOpen { .. }
            | ScanError::PollFailed { .. }
            | ScanError::SourceUnavailable
            | ScanError::Internal { .. } => Self::ScanAdapterError(err.to_string()),
        }
    }
}

impl From<CodecError> for BeaconError {
    fn from(err: CodecError) -> Self {
        Self::MalformedRecord(err.to_string())
    }
}

impl From<ConfigError> for BeaconError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::ReadError { .. }
            | ConfigError::WriteError { .. }
            | ConfigError::ParseError(_)
            | ConfigError::SerializeError(_) => Self::ConfigParseError(err.to_string()),
            ConfigError::ValidationError { .. } => Self::ConfigValidationError(err.to_string()),
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
