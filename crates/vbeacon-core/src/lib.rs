//! # vbeacon-core
//!
//! Core logic for the vbeacon proximity beacon.
//!
//! A beacon session broadcasts an iBeacon-format advertisement identifying
//! the local device, scans for advertisements from peers of the same
//! organization, and raises an alarm when any peer's signal is stronger than
//! a configured RSSI threshold.
//!
//! ## Architecture
//!
//! - [`codec`] - Encoding and decoding of the 23-byte beacon frame
//! - [`advertiser`] - Broadcast lifecycle on top of a platform advertising service
//! - [`scanner`] - Background scan loop feeding the sighting table
//! - [`sightings`] - Concurrent table of the latest RSSI per peer
//! - [`monitor`] - Per-tick proximity evaluation
//! - [`alarm`] - Alarm sinks (log only, external command)
//! - [`service`] - Session orchestration and shutdown
//! - [`config`] - Configuration loading, saving, and validation
//! - [`platform`] - Radio seams with BlueZ and in-memory backends
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared identity and sighting types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod advertiser;
pub mod alarm;
pub mod codec;
pub mod config;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod scanner;
pub mod service;
pub mod sightings;
pub mod stop;
pub mod types;

// Re-export primary types for convenience
pub use advertiser::{Advertiser, AdvertiserError};
pub use alarm::{CommandAlarm, LogAlarm};
pub use codec::{AdvertisementFrame, CodecError, DecodedAdvertisement};
pub use config::{Config, ConfigError, ConfigResult};
pub use error::{BeaconError, Result};
pub use monitor::{AlarmSink, ProximityMonitor, TickReport};
#[cfg(feature = "bluetooth")]
pub use platform::bluez::{BluezAdvertising, BluezScanSource};
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use platform::mock::{MockAdvertising, MockRadio, MockScanSource};
pub use platform::{
    AdvertisementRecord, AdvertisingService, AdvertisingType, Registration, ScanSource,
};
pub use scanner::{ScanError, Scanner};
pub use service::{BeaconService, RunOutcome, RunSummary, ServiceConfig, StopHandle};
pub use sightings::SightingTable;
pub use types::{BeaconIdentity, DeviceKey, Sighting};
