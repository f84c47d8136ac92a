//! Shared beacon types.
//!
//! These are the values that cross module boundaries: the local identity that
//! is broadcast, the key a peer is tracked under, and a single observation of
//! that peer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a beacon: what we broadcast, and what peers must match.
///
/// Immutable once a session starts; freely shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconIdentity {
    /// Organization UUID shared by every beacon in the deployment.
    pub organization_id: Uuid,

    /// Major number (first half of the device key).
    pub major: u16,

    /// Minor number (second half of the device key).
    pub minor: u16,

    /// Calibrated transmit power at 1 m, in dBm.
    pub tx_power: i8,
}

impl BeaconIdentity {
    /// Create a new identity.
    #[must_use]
    pub const fn new(organization_id: Uuid, major: u16, minor: u16, tx_power: i8) -> Self {
        Self {
            organization_id,
            major,
            minor,
            tx_power,
        }
    }

    /// The key peers will track this device under.
    #[must_use]
    pub const fn device_key(&self) -> DeviceKey {
        DeviceKey::new(self.major, self.minor)
    }
}

/// Identifies a peer for the lifetime of a scan session.
///
/// Two peers broadcasting the same major/minor pair cannot be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Peer major number.
    pub major: u16,
    /// Peer minor number.
    pub minor: u16,
}

impl DeviceKey {
    /// Create a key from a major/minor pair.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// Renders as the hex of major followed by the hex of minor, e.g. `0x11220x3344`.
impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}{:#x}", self.major, self.minor)
    }
}

/// Most recent observation of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Which peer was seen.
    pub key: DeviceKey,

    /// When the advertisement was decoded.
    pub observed_at: DateTime<Utc>,

    /// Received signal strength in dBm. Higher (less negative) is closer.
    pub rssi: i16,
}
