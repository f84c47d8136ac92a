//! Table of recently observed peers.
//!
//! The only state shared between the scan thread (writer) and the monitor
//! (reader). Every access takes the single map lock for the duration of one
//! map operation, and readers always get an owned copy back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::types::{DeviceKey, Sighting};

#[derive(Debug, Clone, Copy)]
struct Entry {
    observed_at: DateTime<Utc>,
    rssi: i16,
}

/// Most recent sighting per peer, guarded by one lock.
#[derive(Debug, Default)]
pub struct SightingTable {
    entries: Mutex<HashMap<DeviceKey, Entry>>,
}

impl SightingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // Critical sections never leave the map half-updated, so a poisoned lock
    // still guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the sighting for `key`.
    pub fn upsert(&self, key: DeviceKey, observed_at: DateTime<Utc>, rssi: i16) {
        self.lock().insert(key, Entry { observed_at, rssi });
    }

    /// Keys whose latest signal is stronger than `threshold_rssi`.
    ///
    /// Sightings never expire here; see [`Self::snapshot_violations_since`].
    #[must_use]
    pub fn snapshot_violations(&self, threshold_rssi: i16) -> Vec<DeviceKey> {
        self.snapshot_violations_since(threshold_rssi, None)
    }

    /// Keys whose latest signal is stronger than `threshold_rssi`, ignoring
    /// sightings older than `not_before` when it is set.
    #[must_use]
    pub fn snapshot_violations_since(
        &self,
        threshold_rssi: i16,
        not_before: Option<DateTime<Utc>>,
    ) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.rssi > threshold_rssi)
            .filter(|(_, entry)| not_before.map_or(true, |cutoff| entry.observed_at >= cutoff))
            .map(|(key, _)| *key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Copy of every sighting, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self
            .lock()
            .iter()
            .map(|(key, entry)| Sighting {
                key: *key,
                observed_at: entry.observed_at,
                rssi: entry.rssi,
            })
            .collect();
        sightings.sort_unstable_by_key(|sighting| sighting.key);
        sightings
    }

    /// Remove every sighting.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of peers currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no peer is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_threshold_is_strictly_greater() {
        let table = SightingTable::new();
        let now = Utc::now();
        table.upsert(DeviceKey::new(1, 1), now, -60);
        table.upsert(DeviceKey::new(2, 2), now, -90);
        table.upsert(DeviceKey::new(3, 3), now, -40);
        table.upsert(DeviceKey::new(4, 4), now, -50);

        assert_eq!(table.snapshot_violations(-50), vec![DeviceKey::new(3, 3)]);
    }

    #[test]
    fn test_upsert_overwrites_per_key() {
        let table = SightingTable::new();
        let key = DeviceKey::new(7, 8);
        let earlier = Utc::now();
        let later = earlier + Duration::seconds(2);

        table.upsert(key, earlier, -30);
        table.upsert(key, later, -95);

        assert_eq!(table.len(), 1);
        assert!(table.snapshot_violations(-50).is_empty());
        assert_eq!(
            table.snapshot(),
            vec![Sighting {
                key,
                observed_at: later,
                rssi: -95
            }]
        );
    }

    #[test]
    fn test_old_sightings_count_without_cutoff() {
        let table = SightingTable::new();
        let long_ago = Utc::now() - Duration::hours(3);
        table.upsert(DeviceKey::new(1, 2), long_ago, -20);

        assert_eq!(table.snapshot_violations(-50), vec![DeviceKey::new(1, 2)]);
    }

    #[test]
    fn test_cutoff_excludes_stale_sightings() {
        let table = SightingTable::new();
        let now = Utc::now();
        table.upsert(DeviceKey::new(1, 1), now - Duration::seconds(30), -20);
        table.upsert(DeviceKey::new(2, 2), now - Duration::seconds(1), -20);

        let cutoff = Some(now - Duration::seconds(5));
        assert_eq!(
            table.snapshot_violations_since(-50, cutoff),
            vec![DeviceKey::new(2, 2)]
        );
    }

    #[test]
    fn test_clear_empties_table() {
        let table = SightingTable::new();
        table.upsert(DeviceKey::new(1, 1), Utc::now(), -20);
        assert!(!table.is_empty());

        table.clear();

        assert!(table.is_empty());
        assert!(table.snapshot_violations(-100).is_empty());
    }

    #[test]
    fn test_concurrent_writers_and_readers_never_tear() {
        const WRITERS: u16 = 8;
        const READERS: usize = 4;
        const ROUNDS: i64 = 2_000;

        let table = Arc::new(SightingTable::new());
        let base = Utc::now();

        // Each write pairs the timestamp offset with an rssi derived from it,
        // so a torn entry would break the relation.
        let rssi_for = |offset_ms: i64| -> i16 { -i16::try_from(offset_ms % 100).unwrap() - 1 };

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..ROUNDS {
                        let offset: i64 = rng.gen_range(0..10_000);
                        table.upsert(
                            DeviceKey::new(writer, writer.wrapping_mul(3)),
                            base + Duration::milliseconds(offset),
                            rssi_for(offset),
                        );
                        if rng.gen_bool(0.1) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..ROUNDS {
                        for sighting in table.snapshot() {
                            let offset = (sighting.observed_at - base).num_milliseconds();
                            assert_eq!(sighting.rssi, rssi_for(offset));
                            assert_eq!(sighting.key.minor, sighting.key.major.wrapping_mul(3));
                        }
                        let violations = table.snapshot_violations(rng.gen_range(-101..0));
                        assert!(violations.len() <= usize::from(WRITERS));
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), usize::from(WRITERS));
    }
}
