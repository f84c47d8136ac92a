//! In-memory radio for development and tests.
//!
//! [`MockAdvertising`] records what was registered; [`MockRadio`] is a
//! cloneable feeder handle whose [`MockScanSource`] yields whatever records
//! were pushed into it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::advertiser::AdvertiserError;
use crate::codec::{self, AdvertisementFrame};
use crate::platform::{
    AdvertisementRecord, AdvertisingService, AdvertisingType, Registration, ScanSource,
};
use crate::scanner::ScanError;
use crate::types::BeaconIdentity;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Advertising
// ============================================================================

/// An advertisement accepted by [`MockAdvertising`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredAdvertisement {
    /// Advertising type requested.
    pub kind: AdvertisingType,
    /// Company identifier (little-endian) followed by manufacturer data.
    pub wire_bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct AdvertisingState {
    failure: Option<AdvertiserError>,
    registered: Vec<RegisteredAdvertisement>,
    active: usize,
    unregistered: usize,
}

/// Advertising service that records registrations.
#[derive(Debug, Clone, Default)]
pub struct MockAdvertising {
    state: Arc<Mutex<AdvertisingState>>,
}

impl MockAdvertising {
    /// Create a service that accepts every registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every registration with `error` until [`Self::clear_failure`].
    pub fn fail_with(&self, error: AdvertiserError) {
        lock(&self.state).failure = Some(error);
    }

    /// Accept registrations again.
    pub fn clear_failure(&self) {
        lock(&self.state).failure = None;
    }

    /// Registrations currently live.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.state).active
    }

    /// Registrations accepted so far.
    #[must_use]
    pub fn register_count(&self) -> usize {
        lock(&self.state).registered.len()
    }

    /// Registrations withdrawn so far.
    #[must_use]
    pub fn unregister_count(&self) -> usize {
        lock(&self.state).unregistered
    }

    /// The most recently accepted registration.
    #[must_use]
    pub fn last_registered(&self) -> Option<RegisteredAdvertisement> {
        lock(&self.state).registered.last().cloned()
    }
}

impl AdvertisingService for MockAdvertising {
    fn register(
        &mut self,
        frame: &AdvertisementFrame,
        kind: AdvertisingType,
    ) -> Result<Box<dyn Registration>, AdvertiserError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        state.registered.push(RegisteredAdvertisement {
            kind,
            wire_bytes: frame.to_wire_bytes().to_vec(),
        });
        state.active += 1;
        debug!(kind = ?kind, "Mock advertisement registered");

        Ok(Box::new(MockRegistration {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockRegistration {
    state: Arc<Mutex<AdvertisingState>>,
}

impl Registration for MockRegistration {
    fn unregister(self: Box<Self>) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        state.unregistered += 1;
    }
}

// ============================================================================
// Scanning
// ============================================================================

#[derive(Debug, Default)]
struct RadioState {
    queue: VecDeque<AdvertisementRecord>,
    enabled: bool,
    enable_failure: Option<ScanError>,
    failing_polls: usize,
}

#[derive(Debug, Default)]
struct RadioInner {
    state: Mutex<RadioState>,
    available: Condvar,
}

/// Feeder handle for a simulated scanning radio.
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    inner: Arc<RadioInner>,
}

impl MockRadio {
    /// Create an empty radio.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A scan source reading from this radio.
    #[must_use]
    pub fn source(&self) -> MockScanSource {
        MockScanSource {
            radio: self.clone(),
        }
    }

    /// Queue a raw record for the next poll.
    pub fn push(&self, record: AdvertisementRecord) {
        lock(&self.inner.state).queue.push_back(record);
        self.inner.available.notify_all();
    }

    /// Queue the advertisement `identity` would broadcast, heard at `rssi`.
    pub fn push_beacon(&self, identity: &BeaconIdentity, rssi: i16) {
        let frame = codec::encode(identity);
        self.push(AdvertisementRecord {
            address: None,
            manufacturer_data: vec![(frame.company_id(), frame.manufacturer_data().to_vec())],
            rssi,
        });
    }

    /// Records queued but not yet polled.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    /// Whether scanning is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.state).enabled
    }

    /// Make the next `enable_scan` fail with `error`.
    pub fn fail_next_enable(&self, error: ScanError) {
        lock(&self.inner.state).enable_failure = Some(error);
    }

    /// Make the next `count` polls fail.
    pub fn fail_next_polls(&self, count: usize) {
        lock(&self.inner.state).failing_polls = count;
    }
}

/// Scan source backed by a [`MockRadio`].
#[derive(Debug)]
pub struct MockScanSource {
    radio: MockRadio,
}

impl ScanSource for MockScanSource {
    fn enable_scan(&mut self) -> Result<(), ScanError> {
        let mut state = lock(&self.radio.inner.state);
        if let Some(error) = state.enable_failure.take() {
            return Err(error);
        }
        state.enabled = true;
        Ok(())
    }

    fn poll_events(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<AdvertisementRecord>, ScanError> {
        let inner = &self.radio.inner;
        let deadline = Instant::now() + timeout;
        let mut state = lock(&inner.state);

        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(ScanError::PollFailed {
                message: "simulated poll failure".to_string(),
            });
        }

        while state.queue.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            state = inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let take = max_count.min(state.queue.len());
        Ok(state.queue.drain(..take).collect())
    }

    fn disable_scan(&mut self) {
        lock(&self.radio.inner.state).enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_poll_returns_empty_batch_on_timeout() {
        let radio = MockRadio::new();
        let mut source = radio.source();

        let batch = source.poll_events(8, Duration::from_millis(10)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_poll_respects_max_count() {
        let radio = MockRadio::new();
        let identity = BeaconIdentity::new(Uuid::new_v4(), 1, 2, -59);
        for rssi in [-10, -20, -30] {
            radio.push_beacon(&identity, rssi);
        }
        let mut source = radio.source();

        let first = source.poll_events(2, Duration::from_millis(10)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(radio.pending(), 1);
        assert_eq!(first[0].rssi, -10);
    }

    #[test]
    fn test_registration_failure_is_sticky_until_cleared() {
        let mut platform = MockAdvertising::new();
        let frame = codec::encode(&BeaconIdentity::new(Uuid::nil(), 0, 0, 0));
        platform.fail_with(AdvertiserError::AdapterNotFound);

        assert!(platform.register(&frame, AdvertisingType::Peripheral).is_err());
        assert!(platform.register(&frame, AdvertisingType::Peripheral).is_err());

        platform.clear_failure();
        let registration = platform
            .register(&frame, AdvertisingType::Peripheral)
            .unwrap();
        assert_eq!(platform.active_count(), 1);
        registration.unregister();
        assert_eq!(platform.active_count(), 0);
    }
}
