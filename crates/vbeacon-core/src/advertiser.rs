//! Beacon broadcast lifecycle.
//!
//! The advertiser encodes the local identity once and hands the frame to the
//! platform advertising service. It is either idle or holding exactly one
//! registration.

use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{self, AdvertisementFrame, APPLE_COMPANY_ID};
use crate::platform::{AdvertisingService, AdvertisingType, Registration};
use crate::types::BeaconIdentity;

/// Errors that can occur while starting a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdvertiserError {
    /// No adapter with advertising support was found.
    #[error("No advertising-capable Bluetooth adapter found")]
    AdapterNotFound,

    /// The platform refused the advertisement.
    #[error("Advertisement registration rejected: {message}")]
    RegistrationRejected {
        /// Platform error message.
        message: String,
    },

    /// `start` was called while a broadcast is already live.
    #[error("Advertiser is already running")]
    AlreadyAdvertising,

    /// Unexpected platform failure.
    #[error("Advertiser internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

/// Owns the broadcast of one beacon frame.
pub struct Advertiser {
    service: Box<dyn AdvertisingService>,
    kind: AdvertisingType,
    company_id: u16,
    active: Option<ActiveBroadcast>,
}

struct ActiveBroadcast {
    frame: AdvertisementFrame,
    registration: Box<dyn Registration>,
}

impl Advertiser {
    /// Create an idle advertiser on top of a platform service.
    #[must_use]
    pub fn new(service: Box<dyn AdvertisingService>) -> Self {
        Self {
            service,
            kind: AdvertisingType::default(),
            company_id: APPLE_COMPANY_ID,
            active: None,
        }
    }

    /// Set the advertising type used for subsequent starts.
    #[must_use]
    pub fn with_type(mut self, kind: AdvertisingType) -> Self {
        self.kind = kind;
        self
    }

    /// Set the company identifier the frame is registered under.
    #[must_use]
    pub fn with_company_id(mut self, company_id: u16) -> Self {
        self.company_id = company_id;
        self
    }

    /// Whether a broadcast is live.
    #[must_use]
    pub const fn is_advertising(&self) -> bool {
        self.active.is_some()
    }

    /// The frame currently on air, if any.
    #[must_use]
    pub fn current_frame(&self) -> Option<&AdvertisementFrame> {
        self.active.as_ref().map(|active| &active.frame)
    }

    /// Start broadcasting `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`AdvertiserError::AlreadyAdvertising`] if a broadcast is live,
    /// or the platform error if registration fails. The advertiser stays idle
    /// on error.
    pub fn start(&mut self, identity: &BeaconIdentity) -> Result<(), AdvertiserError> {
        if self.active.is_some() {
            return Err(AdvertiserError::AlreadyAdvertising);
        }

        let frame = codec::encode_with_company(identity, self.company_id);
        debug!(
            company_id = frame.company_id(),
            kind = ?self.kind,
            "Registering beacon advertisement"
        );

        let registration = self.service.register(&frame, self.kind)?;
        self.active = Some(ActiveBroadcast {
            frame,
            registration,
        });

        info!(
            uuid = %identity.organization_id,
            device = %identity.device_key(),
            "Started advertising"
        );
        Ok(())
    }

    /// Stop broadcasting.
    ///
    /// Returns once the platform broadcast loop has exited. Calling this while
    /// idle does nothing.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.registration.unregister();
            info!("Stopped advertising");
        }
    }
}

impl Drop for Advertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
