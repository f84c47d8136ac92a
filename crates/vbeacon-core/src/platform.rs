//! Seams to the host Bluetooth stack.
//!
//! The advertiser and scanner never talk to a radio directly; they go through
//! the traits below. Two backends are provided:
//!
//! - [`bluez`] - BlueZ over D-Bus via `bluer` (feature `bluetooth`)
//! - [`mock`] - in-memory radio for development and tests (feature `mock-bluetooth`)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::advertiser::AdvertiserError;
use crate::codec::AdvertisementFrame;
use crate::scanner::ScanError;

#[cfg(feature = "bluetooth")]
pub mod bluez;

#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;

/// How the advertisement is presented to scanners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvertisingType {
    /// Non-connectable broadcast.
    Broadcast,
    /// Connectable peripheral advertisement.
    #[default]
    Peripheral,
}

/// Platform advertising service.
pub trait AdvertisingService: Send {
    /// Register `frame` with the radio and start broadcasting it.
    ///
    /// May block briefly while the platform accepts the registration.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is available or the registration is
    /// rejected.
    fn register(
        &mut self,
        frame: &AdvertisementFrame,
        kind: AdvertisingType,
    ) -> Result<Box<dyn Registration>, AdvertiserError>;
}

/// A live advertisement registration.
pub trait Registration: Send {
    /// Withdraw the advertisement.
    ///
    /// Returns only once the platform broadcast loop has fully exited.
    fn unregister(self: Box<Self>);
}

/// A raw advertisement as reported by the scanning utility, before beacon
/// decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    /// Advertiser address, when the platform reports one.
    pub address: Option<String>,

    /// Manufacturer-specific data entries keyed by company identifier.
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,

    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Platform scanning utility.
pub trait ScanSource: Send {
    /// Open the radio and enable LE scanning.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::AdapterOpen`] if the radio cannot be opened.
    fn enable_scan(&mut self) -> Result<(), ScanError>;

    /// Pull up to `max_count` records, waiting at most `timeout` for the first.
    ///
    /// An empty batch is a normal result.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio stopped delivering events.
    fn poll_events(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<AdvertisementRecord>, ScanError>;

    /// Disable scanning and release the radio.
    fn disable_scan(&mut self);
}
