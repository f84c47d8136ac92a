//! Cooperative stop signal for the scan and tick loops.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A cloneable, raise-once stop flag that loops can poll or sleep on.
///
/// Once raised it stays raised; a new session needs a new signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    /// Create a lowered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn raise(&self) {
        let (flag, condvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, returning early if the signal is raised.
    ///
    /// Returns `true` if the signal is raised.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut raised = flag.lock().unwrap_or_else(PoisonError::into_inner);

        // Loop to absorb spurious wakeups.
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            raised = condvar
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_when_not_raised() {
        let signal = StopSignal::new();
        let started = Instant::now();

        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_raise_wakes_waiter_early() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let started = Instant::now();

        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.raise();
        });

        assert!(signal.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        raiser.join().unwrap();
    }

    #[test]
    fn test_raise_is_sticky_across_clones() {
        let signal = StopSignal::new();
        let other = signal.clone();
        other.raise();

        assert!(signal.is_raised());
        assert!(signal.wait_timeout(Duration::from_millis(1)));
        assert!(signal.is_raised());
    }
}
