//! Continuous scan loop feeding the sighting table.
//!
//! The scanner moves its platform source onto a dedicated thread for the
//! duration of a session. The thread polls for records, keeps the ones that
//! match our organization, and upserts them into the table. On stop the
//! thread observes the exit flag within one poll cycle, disables the radio,
//! and hands the source back so the scanner can be restarted.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::platform::ScanSource;
use crate::sightings::SightingTable;
use crate::types::BeaconIdentity;

/// Default wait for the first record of a batch.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Default maximum number of records pulled per poll.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Errors that can occur while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// The radio could not be opened for scanning.
    #[error("Failed to open Bluetooth adapter for scanning: {message}")]
    AdapterOpen {
        /// Platform error message.
        message: String,
    },

    /// `start` was called while a session is running.
    #[error("Scanner is already running")]
    AlreadyScanning,

    /// A poll for events failed.
    #[error("Scan poll failed: {message}")]
    PollFailed {
        /// Platform error message.
        message: String,
    },

    /// The platform source was lost (the scan thread panicked).
    #[error("Scan source is no longer available")]
    SourceUnavailable,

    /// Unexpected failure.
    #[error("Scanner internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

/// Owns the scan loop lifecycle.
pub struct Scanner {
    source: Option<Box<dyn ScanSource>>,
    poll_timeout: Duration,
    batch_size: usize,
    session: Option<ScanSession>,
}

struct ScanSession {
    exit: Arc<AtomicBool>,
    handle: JoinHandle<Option<Box<dyn ScanSource>>>,
}

type WorkerBody = Box<dyn FnOnce() -> Option<Box<dyn ScanSource>> + Send>;

impl Scanner {
    /// Create an idle scanner on top of a platform source.
    #[must_use]
    pub fn new(source: Box<dyn ScanSource>) -> Self {
        Self {
            source: Some(source),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            session: None,
        }
    }

    /// Set how long each poll waits for the first record.
    ///
    /// This also bounds how long [`Self::stop`] can take.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the maximum number of records pulled per poll.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Whether a scan session is running.
    #[must_use]
    pub const fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    /// Start scanning for beacons of `identity`'s organization into `sink`.
    ///
    /// The radio is opened before this returns; `sink` is cleared before the
    /// first record is written.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::AlreadyScanning`] if a session is running,
    /// [`ScanError::AdapterOpen`] if the radio cannot be opened, or
    /// [`ScanError::SourceUnavailable`] if a previous session lost the source.
    pub fn start(
        &mut self,
        identity: &BeaconIdentity,
        sink: Arc<SightingTable>,
    ) -> Result<(), ScanError> {
        self.start_with(identity, sink, |builder, body| builder.spawn(body))
    }

    fn start_with(
        &mut self,
        identity: &BeaconIdentity,
        sink: Arc<SightingTable>,
        spawn: impl FnOnce(
            thread::Builder,
            WorkerBody,
        ) -> io::Result<JoinHandle<Option<Box<dyn ScanSource>>>>,
    ) -> Result<(), ScanError> {
        if self.session.is_some() {
            return Err(ScanError::AlreadyScanning);
        }

        let mut source = self.source.take().ok_or(ScanError::SourceUnavailable)?;
        if let Err(e) = source.enable_scan() {
            self.source = Some(source);
            return Err(e);
        }

        sink.clear();

        let exit = Arc::new(AtomicBool::new(false));
        let worker = ScanWorker {
            identity: *identity,
            sink,
            exit: Arc::clone(&exit),
            poll_timeout: self.poll_timeout,
            batch_size: self.batch_size,
        };

        // The source only crosses over once the thread exists, so a failed
        // spawn leaves it here.
        let (source_tx, source_rx) = mpsc::sync_channel::<Box<dyn ScanSource>>(1);
        let body: WorkerBody = Box::new(move || {
            let source = source_rx.recv().ok()?;
            Some(worker.run(source))
        });

        let spawned = spawn(thread::Builder::new().name("vbeacon-scan".to_string()), body);
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                source.disable_scan();
                self.source = Some(source);
                return Err(ScanError::Internal {
                    message: format!("Failed to spawn scan thread: {e}"),
                });
            }
        };

        if let Err(mpsc::SendError(mut source)) = source_tx.send(source) {
            let _ = handle.join();
            source.disable_scan();
            self.source = Some(source);
            return Err(ScanError::Internal {
                message: "Scan thread exited before receiving the radio".to_string(),
            });
        }

        self.session = Some(ScanSession { exit, handle });
        info!(uuid = %identity.organization_id, "Started scanning");
        Ok(())
    }

    /// Stop scanning and wait for the scan thread to exit.
    ///
    /// Calling this while idle does nothing.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.exit.store(true, Ordering::Release);
        match session.handle.join() {
            Ok(Some(source)) => self.source = Some(source),
            Ok(None) => error!("Scan thread never received the radio; scanner cannot be restarted"),
            Err(_) => error!("Scan thread panicked; scanner cannot be restarted"),
        }
        info!("Stopped scanning");
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ScanWorker {
    identity: BeaconIdentity,
    sink: Arc<SightingTable>,
    exit: Arc<AtomicBool>,
    poll_timeout: Duration,
    batch_size: usize,
}

impl ScanWorker {
    fn run(self, mut source: Box<dyn ScanSource>) -> Box<dyn ScanSource> {
        let mut failing = false;
        let mut matched: u64 = 0;

        while !self.exit.load(Ordering::Acquire) {
            let batch = match source.poll_events(self.batch_size, self.poll_timeout) {
                Ok(batch) => {
                    if failing {
                        info!("Scan polling recovered");
                        failing = false;
                    }
                    batch
                }
                Err(e) => {
                    if failing {
                        debug!(error = %e, "Scan poll still failing");
                    } else {
                        warn!(error = %e, "Scan poll failed; retrying");
                        failing = true;
                    }
                    thread::sleep(self.poll_timeout);
                    continue;
                }
            };

            let observed_at = Utc::now();
            for record in &batch {
                let decoded = match codec::decode_record(record) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        debug!(address = ?record.address, error = %e, "Skipping malformed record");
                        continue;
                    }
                };
                if !codec::is_matching_beacon(&decoded, &self.identity) {
                    continue;
                }
                if let Some(key) = codec::device_key_of(&decoded) {
                    trace!(device = %key, rssi = record.rssi, "Beacon sighted");
                    self.sink.upsert(key, observed_at, record.rssi);
                    matched += 1;
                }
            }
        }

        source.disable_scan();
        debug!(matched, "Scan loop exited");
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockRadio;
    use crate::platform::AdvertisementRecord;
    use crate::types::DeviceKey;
    use std::time::Instant;
    use uuid::Uuid;

    fn identity() -> BeaconIdentity {
        BeaconIdentity::new(Uuid::new_v4(), 1, 1, -59)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_matching_beacons_land_in_table() {
        let ours = identity();
        let radio = MockRadio::new();
        let table = Arc::new(SightingTable::new());
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.start(&ours, Arc::clone(&table)).unwrap();
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 10, 20, -59), -45);
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 30, 40, -59), -80);

        assert!(wait_for(|| table.len() == 2));
        scanner.stop();

        assert_eq!(table.snapshot_violations(-50), vec![DeviceKey::new(10, 20)]);
    }

    #[test]
    fn test_foreign_and_malformed_records_are_skipped() {
        let ours = identity();
        let radio = MockRadio::new();
        let table = Arc::new(SightingTable::new());
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.start(&ours, Arc::clone(&table)).unwrap();
        radio.push(AdvertisementRecord {
            address: None,
            manufacturer_data: vec![(0x004C, vec![0x02, 0x15, 0x00])],
            rssi: -20,
        });
        radio.push(AdvertisementRecord {
            address: None,
            manufacturer_data: Vec::new(),
            rssi: -20,
        });
        radio.push_beacon(&BeaconIdentity::new(Uuid::new_v4(), 5, 5, -59), -20);
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 7, 7, -59), -20);

        assert!(wait_for(|| radio.pending() == 0 && table.len() == 1));
        scanner.stop();

        assert_eq!(table.snapshot_violations(-50), vec![DeviceKey::new(7, 7)]);
    }

    #[test]
    fn test_start_clears_stale_sightings() {
        let table = Arc::new(SightingTable::new());
        table.upsert(DeviceKey::new(9, 9), Utc::now(), -10);
        let radio = MockRadio::new();
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.start(&identity(), Arc::clone(&table)).unwrap();

        assert!(table.is_empty());
        scanner.stop();
    }

    #[test]
    fn test_adapter_open_failure_surfaces_and_allows_retry() {
        let radio = MockRadio::new();
        radio.fail_next_enable(ScanError::AdapterOpen {
            message: "hci0 not found".to_string(),
        });
        let mut scanner = Scanner::new(Box::new(radio.source()));
        let table = Arc::new(SightingTable::new());

        let err = scanner.start(&identity(), Arc::clone(&table)).unwrap_err();
        assert!(matches!(err, ScanError::AdapterOpen { .. }));
        assert!(!scanner.is_scanning());

        scanner.start(&identity(), table).unwrap();
        assert!(scanner.is_scanning());
        scanner.stop();
    }

    #[test]
    fn test_failed_thread_spawn_keeps_radio_and_allows_retry() {
        let ours = identity();
        let radio = MockRadio::new();
        let table = Arc::new(SightingTable::new());
        let mut scanner = Scanner::new(Box::new(radio.source()));

        let err = scanner
            .start_with(&ours, Arc::clone(&table), |_, _| {
                Err(io::Error::other("thread limit reached"))
            })
            .unwrap_err();

        assert!(matches!(err, ScanError::Internal { .. }));
        assert!(!scanner.is_scanning());
        assert!(!radio.is_enabled());

        scanner.start(&ours, Arc::clone(&table)).unwrap();
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 6, 6, -59), -30);
        assert!(wait_for(|| table.len() == 1));
        scanner.stop();
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let radio = MockRadio::new();
        let mut scanner = Scanner::new(Box::new(radio.source()));
        let table = Arc::new(SightingTable::new());

        scanner.start(&identity(), Arc::clone(&table)).unwrap();
        assert_eq!(
            scanner.start(&identity(), table).unwrap_err(),
            ScanError::AlreadyScanning
        );
        scanner.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_disables_radio() {
        let radio = MockRadio::new();
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.stop();
        scanner.start(&identity(), Arc::new(SightingTable::new())).unwrap();
        assert!(radio.is_enabled());

        scanner.stop();
        scanner.stop();

        assert!(!scanner.is_scanning());
        assert!(!radio.is_enabled());
    }

    #[test]
    fn test_poll_failures_do_not_end_session() {
        let ours = identity();
        let radio = MockRadio::new();
        radio.fail_next_polls(3);
        let table = Arc::new(SightingTable::new());
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.start(&ours, Arc::clone(&table)).unwrap();
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 2, 3, -59), -30);

        assert!(wait_for(|| table.len() == 1));
        assert!(scanner.is_scanning());
        scanner.stop();
    }

    #[test]
    fn test_stop_latency_is_bounded_by_poll_timeout() {
        let radio = MockRadio::new();
        let mut scanner =
            Scanner::new(Box::new(radio.source())).with_poll_timeout(Duration::from_millis(50));
        scanner.start(&identity(), Arc::new(SightingTable::new())).unwrap();

        let started = Instant::now();
        scanner.stop();

        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_restart_after_stop() {
        let ours = identity();
        let radio = MockRadio::new();
        let mut scanner = Scanner::new(Box::new(radio.source()));

        scanner.start(&ours, Arc::new(SightingTable::new())).unwrap();
        scanner.stop();

        let table = Arc::new(SightingTable::new());
        scanner.start(&ours, Arc::clone(&table)).unwrap();
        radio.push_beacon(&BeaconIdentity::new(ours.organization_id, 4, 4, -59), -30);
        assert!(wait_for(|| table.len() == 1));
        scanner.stop();
    }
}
