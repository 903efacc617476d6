//! Deterministic clock for readiness tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::readiness::Clock;

#[derive(Debug)]
struct State {
    now: Instant,
    origin: Instant,
    sleeps: Vec<Duration>,
}

/// [`Clock`] whose time only advances when something sleeps on it.
///
/// Clones share the same timeline.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use tiny_postgres::Clock;
/// use tiny_postgres::test_support::FakeClock;
///
/// let clock = FakeClock::new();
/// clock.sleep(Duration::from_millis(250));
/// assert_eq!(clock.elapsed(), Duration::from_millis(250));
/// assert_eq!(clock.sleeps(), vec![Duration::from_millis(250)]);
/// ```
#[derive(Debug, Clone)]
pub struct FakeClock {
    state: Arc<Mutex<State>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Creates a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            state: Arc::new(Mutex::new(State {
                now: origin,
                origin,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Returns every sleep requested so far, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Returns the time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let state = self.lock();
        state.now.saturating_duration_since(state.origin)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += duration;
        state.sleeps.push(duration);
    }
}
