//! Beacon session orchestration.
//!
//! [`BeaconService::run`] advertises, scans into a fresh sighting table, and
//! ticks the proximity monitor once per interval until the configured
//! duration elapses or a [`StopHandle`] is raised. Scanner and advertiser
//! are stopped, in that order, on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::advertiser::Advertiser;
use crate::error::{BeaconError, Result};
use crate::monitor::{AlarmSink, ProximityMonitor};
use crate::scanner::Scanner;
use crate::sightings::SightingTable;
use crate::stop::StopSignal;
use crate::types::BeaconIdentity;

/// Default time between monitor ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters for one beacon session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// What we broadcast and which organization we listen for.
    pub identity: BeaconIdentity,
    /// Number of ticks before the session ends on its own.
    pub on_duration_secs: u64,
    /// Peers stronger than this (dBm) raise the alarm.
    pub proximity_threshold_rssi: i16,
    /// Ignore sightings older than this. `None` keeps every sighting.
    pub stale_after: Option<Duration>,
    /// Wake-up time used to report the remaining sleep interval.
    pub wake_time_secs: Option<u64>,
    /// Time between ticks.
    pub tick_interval: Duration,
}

impl ServiceConfig {
    /// Create a config with the default tick interval and no staleness window.
    #[must_use]
    pub const fn new(
        identity: BeaconIdentity,
        on_duration_secs: u64,
        proximity_threshold_rssi: i16,
    ) -> Self {
        Self {
            identity,
            on_duration_secs,
            proximity_threshold_rssi,
            stale_after: None,
            wake_time_secs: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// Set the staleness window.
    #[must_use]
    pub const fn with_stale_after(mut self, window: Option<Duration>) -> Self {
        self.stale_after = window;
        self
    }

    /// Set the wake-up time reported in [`RunSummary::wake_after_secs`].
    #[must_use]
    pub const fn with_wake_time_secs(mut self, wake_time_secs: Option<u64>) -> Self {
        self.wake_time_secs = wake_time_secs;
        self
    }

    /// Set the time between ticks.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Requests an early end to a running session.
///
/// Cloneable and usable from any thread, including a signal handler task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    signal: StopSignal,
}

impl StopHandle {
    /// Ask the session to stop. The tick loop wakes immediately.
    pub fn stop(&self) {
        self.signal.raise();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.signal.is_raised()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The configured duration elapsed.
    Completed,
    /// A [`StopHandle`] was raised.
    StopRequested,
}

/// What happened during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Monitor ticks executed.
    pub ticks: u64,
    /// Ticks on which the alarm fired.
    pub alarms: u64,
    /// Why the session ended.
    pub outcome: RunOutcome,
    /// Seconds until the configured wake-up time, if one is set.
    pub wake_after_secs: Option<u64>,
}

/// Runs advertiser, scanner and proximity monitor together.
pub struct BeaconService {
    config: ServiceConfig,
    advertiser: Advertiser,
    scanner: Scanner,
    monitor: ProximityMonitor,
    stop: StopHandle,
}

impl BeaconService {
    /// Assemble a service from its parts.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        advertiser: Advertiser,
        scanner: Scanner,
        alarm: Arc<dyn AlarmSink>,
    ) -> Self {
        let monitor = ProximityMonitor::new(config.proximity_threshold_rssi, alarm)
            .with_stale_after(config.stale_after);
        Self {
            config,
            advertiser,
            scanner,
            monitor,
            stop: StopHandle::default(),
        }
    }

    /// The session configuration.
    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// A handle that ends [`Self::run`] early.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run one session to completion.
    ///
    /// A stop requested before `run` is called ends the session after
    /// startup without any ticks. A stop is never cleared, so later calls on
    /// the same service also end right after startup.
    ///
    /// # Errors
    ///
    /// Returns an advertiser error if advertising cannot start (nothing else
    /// is started), or a scan error if scanning cannot start (advertising is
    /// withdrawn first).
    #[instrument(skip(self), fields(device = %self.config.identity.device_key()))]
    pub fn run(&mut self) -> Result<RunSummary> {
        let identity = self.config.identity;

        self.advertiser.start(&identity).map_err(BeaconError::from)?;

        let table = Arc::new(SightingTable::new());
        if let Err(e) = self.scanner.start(&identity, Arc::clone(&table)) {
            warn!(error = %e, "Scanner failed to start; withdrawing advertisement");
            self.advertiser.stop();
            return Err(e.into());
        }

        info!(
            on_duration_secs = self.config.on_duration_secs,
            threshold_rssi = self.config.proximity_threshold_rssi,
            "Beacon session started"
        );

        let (ticks, alarms, outcome) = self.monitor_loop(&table);

        info!(ticks, alarms, outcome = ?outcome, "Shutting down beacon session");
        self.scanner.stop();
        self.advertiser.stop();

        let wake_after_secs = self
            .config
            .wake_time_secs
            .map(|wake| wake.saturating_sub(ticks));
        if let Some(secs) = wake_after_secs {
            info!(wake_after_secs = secs, "Wake-up scheduled");
        }

        Ok(RunSummary {
            ticks,
            alarms,
            outcome,
            wake_after_secs,
        })
    }

    fn monitor_loop(&self, table: &SightingTable) -> (u64, u64, RunOutcome) {
        let mut ticks = 0;
        let mut alarms = 0;

        while ticks < self.config.on_duration_secs {
            if self.stop.signal.wait_timeout(self.config.tick_interval) {
                return (ticks, alarms, RunOutcome::StopRequested);
            }
            ticks += 1;
            if self.monitor.tick(table).alarmed {
                alarms += 1;
            }
        }

        if self.stop.is_stop_requested() {
            (ticks, alarms, RunOutcome::StopRequested)
        } else {
            (ticks, alarms, RunOutcome::Completed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertiser::AdvertiserError;
    use crate::platform::mock::{MockAdvertising, MockRadio};
    use crate::scanner::ScanError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Instant;
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingAlarm(AtomicU64);

    impl AlarmSink for CountingAlarm {
        fn trigger(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        advertising: MockAdvertising,
        radio: MockRadio,
        alarm: Arc<CountingAlarm>,
        service: BeaconService,
    }

    fn identity() -> BeaconIdentity {
        BeaconIdentity::new(Uuid::new_v4(), 0x1122, 0x3344, -59)
    }

    fn harness(ticks: u64, tick_interval: Duration) -> Harness {
        let advertising = MockAdvertising::new();
        let radio = MockRadio::new();
        let alarm = Arc::new(CountingAlarm::default());
        let config = ServiceConfig::new(identity(), ticks, -60).with_tick_interval(tick_interval);
        let service = BeaconService::new(
            config,
            Advertiser::new(Box::new(advertising.clone())),
            Scanner::new(Box::new(radio.source())),
            alarm.clone(),
        );
        Harness {
            advertising,
            radio,
            alarm,
            service,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_no_peers_means_no_alarms() {
        let mut h = harness(3, Duration::from_millis(20));

        let summary = h.service.run().unwrap();

        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.alarms, 0);
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(h.alarm.0.load(Ordering::SeqCst), 0);
        assert_eq!(h.advertising.active_count(), 0);
        assert!(!h.radio.is_enabled());
    }

    #[test]
    fn test_peer_injected_before_second_tick_alarms_on_ticks_two_and_three() {
        let interval = Duration::from_millis(300);
        let Harness {
            advertising,
            radio,
            alarm,
            mut service,
        } = harness(3, interval);
        let peer = BeaconIdentity::new(service.config().identity.organization_id, 7, 7, -59);

        let runner = thread::spawn(move || service.run());

        // Scanning starts right before the first tick wait.
        assert!(wait_for(|| radio.is_enabled()));
        thread::sleep(interval + interval / 2);
        assert_eq!(alarm.0.load(Ordering::SeqCst), 0);
        radio.push_beacon(&peer, -40);

        let summary = runner.join().unwrap().unwrap();

        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.alarms, 2);
        assert_eq!(alarm.0.load(Ordering::SeqCst), 2);
        assert_eq!(advertising.active_count(), 0);
    }

    #[test]
    fn test_advertise_failure_never_starts_scanner() {
        let mut h = harness(3, Duration::from_millis(10));
        h.advertising.fail_with(AdvertiserError::AdapterNotFound);

        let err = h.service.run().unwrap_err();

        assert!(err.is_advertiser_error());
        assert!(!h.radio.is_enabled());
        assert_eq!(h.advertising.register_count(), 0);
    }

    #[test]
    fn test_scan_failure_withdraws_advertisement() {
        let mut h = harness(3, Duration::from_millis(10));
        h.radio.fail_next_enable(ScanError::AdapterOpen {
            message: "hci0 busy".to_string(),
        });

        let err = h.service.run().unwrap_err();

        assert!(err.is_scan_error());
        assert_eq!(h.advertising.register_count(), 1);
        assert_eq!(h.advertising.active_count(), 0);
        assert_eq!(h.alarm.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_request_ends_session_and_cleans_up() {
        let Harness {
            advertising,
            radio,
            mut service,
            ..
        } = harness(1_000, Duration::from_secs(1));
        let stop = service.stop_handle();

        let runner = thread::spawn(move || service.run());
        assert!(wait_for(|| radio.is_enabled()));

        let requested = Instant::now();
        stop.stop();
        let summary = runner.join().unwrap().unwrap();

        assert!(requested.elapsed() < Duration::from_secs(2));
        assert_eq!(summary.outcome, RunOutcome::StopRequested);
        assert!(summary.ticks < 1_000);
        assert_eq!(advertising.active_count(), 0);
        assert!(!radio.is_enabled());
    }

    #[test]
    fn test_stop_before_run_skips_ticks() {
        let mut h = harness(5, Duration::from_secs(1));
        h.service.stop_handle().stop();

        let summary = h.service.run().unwrap();

        assert_eq!(summary.ticks, 0);
        assert_eq!(summary.outcome, RunOutcome::StopRequested);
        assert_eq!(h.advertising.unregister_count(), 1);

        let again = h.service.run().unwrap();
        assert_eq!(again.ticks, 0);
        assert_eq!(again.outcome, RunOutcome::StopRequested);
    }

    #[test]
    fn test_wake_after_saturates() {
        let advertising = MockAdvertising::new();
        let radio = MockRadio::new();
        let config = ServiceConfig::new(identity(), 2, -60)
            .with_tick_interval(Duration::from_millis(5))
            .with_wake_time_secs(Some(1));
        let mut service = BeaconService::new(
            config,
            Advertiser::new(Box::new(advertising)),
            Scanner::new(Box::new(radio.source())),
            Arc::new(CountingAlarm::default()),
        );

        let summary = service.run().unwrap();

        assert_eq!(summary.wake_after_secs, Some(0));
    }

    #[test]
    fn test_service_can_run_twice() {
        let mut h = harness(1, Duration::from_millis(5));

        h.service.run().unwrap();
        h.service.run().unwrap();

        assert_eq!(h.advertising.register_count(), 2);
        assert_eq!(h.advertising.active_count(), 0);
    }
}
