//! Proximity evaluation.
//!
//! Each tick reads a copy of the violating keys from the sighting table and
//! fires the alarm at most once, no matter how many peers are too close.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::sightings::SightingTable;
use crate::types::DeviceKey;

/// Receives "too close" notifications.
///
/// Implementations must return quickly; the monitor tick waits on them.
pub trait AlarmSink: Send + Sync {
    /// Signal that at least one peer is closer than the threshold.
    fn trigger(&self);
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Peers stronger than the threshold, ordered by key.
    pub violations: Vec<DeviceKey>,
    /// Whether the alarm was triggered.
    pub alarmed: bool,
}

/// Evaluates the sighting table against an RSSI threshold.
pub struct ProximityMonitor {
    threshold_rssi: i16,
    stale_after: Option<Duration>,
    alarm: Arc<dyn AlarmSink>,
}

impl ProximityMonitor {
    /// Create a monitor that alarms when any peer is stronger than
    /// `threshold_rssi`.
    #[must_use]
    pub fn new(threshold_rssi: i16, alarm: Arc<dyn AlarmSink>) -> Self {
        Self {
            threshold_rssi,
            stale_after: None,
            alarm,
        }
    }

    /// Ignore sightings older than `window`.
    ///
    /// Without this, a peer seen once keeps counting for the whole session.
    #[must_use]
    pub fn with_stale_after(mut self, window: Option<Duration>) -> Self {
        self.stale_after = window;
        self
    }

    /// Configured threshold in dBm.
    #[must_use]
    pub const fn threshold_rssi(&self) -> i16 {
        self.threshold_rssi
    }

    /// Evaluate `table` once.
    pub fn tick(&self, table: &SightingTable) -> TickReport {
        let not_before = self.stale_after.and_then(|window| {
            chrono::Duration::from_std(window)
                .ok()
                .and_then(|window| Utc::now().checked_sub_signed(window))
        });

        let violations = table.snapshot_violations_since(self.threshold_rssi, not_before);
        if violations.is_empty() {
            debug!(tracked = table.len(), "Proximity check passed");
            return TickReport::default();
        }

        let devices: Vec<String> = violations.iter().map(ToString::to_string).collect();
        warn!(
            threshold_rssi = self.threshold_rssi,
            devices = ?devices,
            "Proximity violation"
        );
        self.alarm.trigger();

        TickReport {
            violations,
            alarmed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAlarm(AtomicUsize);

    impl AlarmSink for CountingAlarm {
        fn trigger(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor(threshold: i16) -> (ProximityMonitor, Arc<CountingAlarm>) {
        let alarm = Arc::new(CountingAlarm::default());
        (ProximityMonitor::new(threshold, alarm.clone()), alarm)
    }

    #[test]
    fn test_empty_table_does_not_alarm() {
        let (monitor, alarm) = monitor(-50);

        let report = monitor.tick(&SightingTable::new());

        assert!(!report.alarmed);
        assert_eq!(alarm.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_alarm_fires_once_for_many_violators() {
        let (monitor, alarm) = monitor(-50);
        let table = SightingTable::new();
        let now = Utc::now();
        table.upsert(DeviceKey::new(1, 1), now, -40);
        table.upsert(DeviceKey::new(2, 2), now, -30);
        table.upsert(DeviceKey::new(3, 3), now, -90);

        let report = monitor.tick(&table);

        assert!(report.alarmed);
        assert_eq!(
            report.violations,
            vec![DeviceKey::new(1, 1), DeviceKey::new(2, 2)]
        );
        assert_eq!(alarm.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alarm_refires_every_tick_while_condition_holds() {
        let (monitor, alarm) = monitor(-50);
        let table = SightingTable::new();
        table.upsert(DeviceKey::new(1, 1), Utc::now(), -40);

        for _ in 0..3 {
            monitor.tick(&table);
        }

        assert_eq!(alarm.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_stale_window_ignores_old_sightings() {
        let alarm = Arc::new(CountingAlarm::default());
        let monitor = ProximityMonitor::new(-50, alarm.clone())
            .with_stale_after(Some(Duration::from_secs(10)));
        let table = SightingTable::new();
        table.upsert(
            DeviceKey::new(1, 1),
            Utc::now() - chrono::Duration::seconds(60),
            -20,
        );

        assert!(!monitor.tick(&table).alarmed);

        table.upsert(DeviceKey::new(1, 1), Utc::now(), -20);
        assert!(monitor.tick(&table).alarmed);
        assert_eq!(alarm.0.load(Ordering::SeqCst), 1);
    }
}
