//! iBeacon-style manufacturer data encoding and decoding.
//!
//! The manufacturer data block that follows the company identifier is laid
//! out as:
//!
//! ```text
//! offset  len  field
//! 0       2    beacon type marker (0x02, 0x15)
//! 2       16   organization UUID (big-endian bytes)
//! 18      2    major (big-endian)
//! 20      2    minor (big-endian)
//! 22      1    tx power (two's complement)
//! ```
//!
//! The company identifier itself travels little-endian ahead of the block.

use thiserror::Error;
use uuid::Uuid;

use crate::platform::AdvertisementRecord;
use crate::types::{BeaconIdentity, DeviceKey};

/// Marker that identifies an iBeacon-style payload.
pub const BEACON_TYPE_MARKER: [u8; 2] = [0x02, 0x15];

/// Length of the manufacturer data block after the company identifier.
pub const FRAME_LEN: usize = 23;

/// Company identifier used by iBeacon payloads.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Errors that can occur while decoding a single advertisement record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The record carries the beacon marker but is not a valid beacon payload.
    #[error("Malformed beacon record from company {company_id:#06x}: {reason}")]
    MalformedRecord {
        /// Company identifier the payload was found under.
        company_id: u16,
        /// What was wrong with it.
        reason: String,
    },
}

/// Wire-level manufacturer data for one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementFrame {
    company_id: u16,
    data: [u8; FRAME_LEN],
}

impl AdvertisementFrame {
    /// Company identifier the block is registered under.
    #[must_use]
    pub const fn company_id(&self) -> u16 {
        self.company_id
    }

    /// The 23-byte block that follows the company identifier.
    #[must_use]
    pub const fn manufacturer_data(&self) -> &[u8; FRAME_LEN] {
        &self.data
    }

    /// Company identifier (little-endian) followed by the manufacturer data.
    #[must_use]
    pub fn to_wire_bytes(&self) -> [u8; FRAME_LEN + 2] {
        let mut out = [0u8; FRAME_LEN + 2];
        out[..2].copy_from_slice(&self.company_id.to_le_bytes());
        out[2..].copy_from_slice(&self.data);
        out
    }
}

/// An advertisement after beacon decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedAdvertisement {
    /// An iBeacon-style payload.
    IBeacon {
        /// Organization UUID.
        uuid: Uuid,
        /// Major number.
        major: u16,
        /// Minor number.
        minor: u16,
        /// Calibrated transmit power in dBm.
        tx_power: i8,
        /// Received signal strength in dBm.
        rssi: i16,
    },
    /// Anything else.
    Other,
}

/// Encode `identity` under the iBeacon company identifier.
#[must_use]
pub fn encode(identity: &BeaconIdentity) -> AdvertisementFrame {
    encode_with_company(identity, APPLE_COMPANY_ID)
}

/// Encode `identity` under an explicit company identifier.
#[must_use]
pub fn encode_with_company(identity: &BeaconIdentity, company_id: u16) -> AdvertisementFrame {
    let mut data = [0u8; FRAME_LEN];
    data[0..2].copy_from_slice(&BEACON_TYPE_MARKER);
    data[2..18].copy_from_slice(identity.organization_id.as_bytes());
    data[18..20].copy_from_slice(&identity.major.to_be_bytes());
    data[20..22].copy_from_slice(&identity.minor.to_be_bytes());
    data[22] = identity.tx_power.to_be_bytes()[0];
    AdvertisementFrame { company_id, data }
}

/// Decode a raw record.
///
/// The first manufacturer entry that starts with [`BEACON_TYPE_MARKER`] and
/// is exactly [`FRAME_LEN`] bytes long is taken as the beacon payload.
/// Records without a marked entry decode to [`DecodedAdvertisement::Other`].
///
/// # Errors
///
/// Returns [`CodecError::MalformedRecord`] if entries carry the marker but
/// none of them has the beacon length.
pub fn decode_record(record: &AdvertisementRecord) -> Result<DecodedAdvertisement, CodecError> {
    let marked = || {
        record
            .manufacturer_data
            .iter()
            .filter(|(_, data)| data.starts_with(&BEACON_TYPE_MARKER))
    };

    let Some((company_id, first)) = marked().next() else {
        return Ok(DecodedAdvertisement::Other);
    };

    let data: &[u8; FRAME_LEN] = marked()
        .find_map(|(_, data)| data.as_slice().try_into().ok())
        .ok_or_else(|| CodecError::MalformedRecord {
            company_id: *company_id,
            reason: format!("expected {FRAME_LEN} bytes, got {}", first.len()),
        })?;

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&data[2..18]);

    Ok(DecodedAdvertisement::IBeacon {
        uuid: Uuid::from_bytes(uuid),
        major: u16::from_be_bytes([data[18], data[19]]),
        minor: u16::from_be_bytes([data[20], data[21]]),
        tx_power: i8::from_be_bytes([data[22]]),
        rssi: record.rssi,
    })
}

/// Whether `record` is a beacon of the same organization as `identity`.
///
/// Major and minor are ignored.
#[must_use]
pub fn is_matching_beacon(record: &DecodedAdvertisement, identity: &BeaconIdentity) -> bool {
    matches!(record, DecodedAdvertisement::IBeacon { uuid, .. } if *uuid == identity.organization_id)
}

/// The key a decoded beacon is tracked under, or `None` for non-beacons.
#[must_use]
pub const fn device_key_of(record: &DecodedAdvertisement) -> Option<DeviceKey> {
    match record {
        DecodedAdvertisement::IBeacon { major, minor, .. } => Some(DeviceKey::new(*major, *minor)),
        DecodedAdvertisement::Other => None,
    }
}
