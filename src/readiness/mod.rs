//! Polls a launched server until it answers queries.
//!
//! Readiness means a client can connect and run `SELECT 1`. The loop is the
//! only place where the crate waits on the server: failed attempts are
//! retried on the [`RetryPolicy`] schedule until the start budget runs out,
//! and the error of the final attempt is returned inside a [`TimeoutError`].

mod policy;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Report;
use color_eyre::eyre::{WrapErr, eyre};
use postgres::NoTls;
use tracing::{debug, info_span};

pub use self::policy::{Clock, RetryPolicy, SystemClock};
use crate::connection::ConnectionParams;
use crate::error::TimeoutError;
use crate::observability::LOG_TARGET;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(10);

/// A single readiness check against a server.
#[cfg_attr(test, mockall::automock)]
pub trait Probe: Send + Sync {
    /// Checks whether the server answers, spending at most roughly `budget`.
    ///
    /// # Errors
    /// Returns the reason the server is not ready yet.
    fn probe(&self, params: &ConnectionParams, budget: Duration) -> Result<(), Report>;
}

/// [`Probe`] that connects with the `postgres` client and runs `SELECT 1`.
#[derive(Debug, Clone, Copy)]
pub struct PostgresProbe {
    connect_timeout: Duration,
}

impl Default for PostgresProbe {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PostgresProbe {
    /// Caps how long a single connection attempt may take.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(MIN_CONNECT_TIMEOUT);
        self
    }
}

impl Probe for PostgresProbe {
    fn probe(&self, params: &ConnectionParams, budget: Duration) -> Result<(), Report> {
        let mut config = params.to_client_config();
        config.connect_timeout(self.connect_timeout.min(budget).max(MIN_CONNECT_TIMEOUT));
        let mut client = config
            .connect(NoTls)
            .wrap_err_with(|| format!("failed to connect to {}", params.url()))?;
        let row = client
            .query_one("SELECT 1", &[])
            .wrap_err("readiness query failed")?;
        let value: i32 = row.try_get(0).wrap_err("readiness query returned no value")?;
        if value != 1 {
            return Err(eyre!("readiness query returned {value}, expected 1"));
        }
        Ok(())
    }
}

/// Summary of a successful readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    attempts: u32,
    elapsed: Duration,
}

impl Readiness {
    /// Returns how many probes ran, including the successful one.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the time spent waiting.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Why a supervised poll stopped without success.
#[derive(Debug)]
pub(crate) enum PollError<E> {
    Timeout(TimeoutError),
    Aborted(E),
}

/// Repeats a [`Probe`] until it succeeds or the budget elapses.
///
/// # Examples
/// ```no_run
/// use std::time::Duration;
/// use tiny_postgres::{ConnectionParams, ReadinessProber};
///
/// let params = ConnectionParams::new("127.0.0.1", 5432, "postgres", "postgres");
/// let readiness = ReadinessProber::default().wait_ready(&params, Duration::from_secs(5))?;
/// println!("ready after {} attempt(s)", readiness.attempts());
/// # Ok::<(), tiny_postgres::TimeoutError>(())
/// ```
#[derive(Clone)]
pub struct ReadinessProber {
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ReadinessProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProber")
            .field("clock", &self.clock)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new(Arc::new(PostgresProbe::default()))
    }
}

impl ReadinessProber {
    /// Creates a prober using `probe`, the system clock and the default policy.
    #[must_use]
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
        }
    }

    /// Replaces the probe, keeping the clock and backoff schedule.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the clock used for deadlines and sleeps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the backoff schedule.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the active backoff schedule.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Waits until the server described by `params` answers, or `timeout`
    /// elapses.
    ///
    /// At least one probe is always made, even with a zero timeout.
    ///
    /// # Errors
    /// Returns [`TimeoutError`] carrying the final probe error when the
    /// budget or the attempt limit is exhausted.
    pub fn wait_ready(
        &self,
        params: &ConnectionParams,
        timeout: Duration,
    ) -> Result<Readiness, TimeoutError> {
        self.poll(params, timeout, || Ok::<(), Infallible>(()))
            .map_err(|err| match err {
                PollError::Timeout(timeout) => timeout,
                PollError::Aborted(never) => match never {},
            })
    }

    /// Polls like [`wait_ready`](Self::wait_ready), consulting `check` before
    /// every attempt and stopping as soon as it fails.
    pub(crate) fn poll<E, F>(
        &self,
        params: &ConnectionParams,
        timeout: Duration,
        mut check: F,
    ) -> Result<Readiness, PollError<E>>
    where
        F: FnMut() -> Result<(), E>,
    {
        let span = info_span!(target: LOG_TARGET, "readiness", port = params.port());
        let _entered = span.enter();
        let started = self.clock.now();
        let deadline = started.checked_add(timeout);
        let remaining = |clock: &dyn Clock| {
            deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(clock.now())
            })
        };
        let mut attempts: u32 = 0;
        loop {
            check().map_err(PollError::Aborted)?;
            attempts = attempts.saturating_add(1);
            let err = match self.probe.probe(params, remaining(self.clock.as_ref())) {
                Ok(()) => {
                    let elapsed = self.clock.now().saturating_duration_since(started);
                    debug!(target: LOG_TARGET, attempts, ?elapsed, "server is ready");
                    return Ok(Readiness { attempts, elapsed });
                }
                Err(err) => err,
            };
            let left = remaining(self.clock.as_ref());
            if left.is_zero() || self.policy.is_exhausted(attempts) {
                debug!(target: LOG_TARGET, attempts, error = %err, "readiness budget exhausted");
                return Err(PollError::Timeout(TimeoutError::new(timeout, attempts, err)));
            }
            let delay = self.policy.delay_for(attempts).min(left);
            debug!(target: LOG_TARGET, attempts, ?delay, error = %err, "server not ready yet");
            self.clock.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeClock;
    use rstest::{fixture, rstest};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[fixture]
    fn params() -> ConnectionParams {
        ConnectionParams::new("127.0.0.1", 54_400, "tester", "postgres")
    }

    fn prober_with(probe: MockProbe, clock: &FakeClock) -> ReadinessProber {
        ReadinessProber::new(Arc::new(probe)).with_clock(Arc::new(clock.clone()))
    }

    fn failing_until(successful_attempt: Option<u32>) -> MockProbe {
        let calls = Arc::new(AtomicU32::new(0));
        let mut probe = MockProbe::new();
        probe.expect_probe().returning(move |_, _| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(attempt) == successful_attempt {
                Ok(())
            } else {
                Err(eyre!("connection refused (attempt {attempt})"))
            }
        });
        probe
    }

    #[rstest]
    fn succeeds_after_transient_failures(params: ConnectionParams) {
        let clock = FakeClock::new();
        let prober = prober_with(failing_until(Some(3)), &clock);

        let readiness = prober
            .wait_ready(&params, Duration::from_secs(5))
            .expect("ready");

        assert_eq!(readiness.attempts(), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(readiness.elapsed(), Duration::from_millis(300));
    }

    #[rstest]
    fn timeout_keeps_final_error_and_never_overshoots(params: ConnectionParams) {
        let clock = FakeClock::new();
        let prober = prober_with(failing_until(None), &clock);
        let budget = Duration::from_secs(1);

        let err = prober.wait_ready(&params, budget).expect_err("timeout");

        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(300),
            ]
        );
        assert_eq!(clock.elapsed(), budget);
        assert_eq!(err.attempts(), 5);
        assert_eq!(err.timeout(), budget);
        assert!(
            err.last_error().to_string().contains("attempt 5"),
            "{}",
            err.last_error()
        );
    }

    #[rstest]
    fn zero_timeout_still_probes_once(params: ConnectionParams) {
        let clock = FakeClock::new();
        let mut probe = MockProbe::new();
        probe
            .expect_probe()
            .times(1)
            .returning(|_, budget| Err(eyre!("refused with budget {budget:?}")));
        let prober = prober_with(probe, &clock);

        let err = prober
            .wait_ready(&params, Duration::ZERO)
            .expect_err("timeout");

        assert_eq!(err.attempts(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[rstest]
    fn attempt_limit_stops_early(params: ConnectionParams) {
        let clock = FakeClock::new();
        let prober = prober_with(failing_until(None), &clock)
            .with_policy(RetryPolicy::default().with_max_attempts(2));

        let err = prober
            .wait_ready(&params, Duration::from_secs(60))
            .expect_err("limit reached");

        assert_eq!(err.attempts(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[rstest]
    fn probe_budget_shrinks_with_elapsed_time(params: ConnectionParams) {
        let clock = FakeClock::new();
        let budgets = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&budgets);
        let mut probe = MockProbe::new();
        probe.expect_probe().returning(move |_, budget| {
            seen.lock().expect("budgets lock").push(budget);
            Err(eyre!("refused"))
        });
        let prober = prober_with(probe, &clock);

        drop(prober.wait_ready(&params, Duration::from_millis(250)));

        let budgets = budgets.lock().expect("budgets lock").clone();
        assert_eq!(
            budgets,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(150),
                Duration::ZERO,
            ]
        );
    }

    #[rstest]
    fn failing_check_aborts_before_next_probe(params: ConnectionParams) {
        let clock = FakeClock::new();
        let mut probe = MockProbe::new();
        probe
            .expect_probe()
            .times(1)
            .returning(|_, _| Err(eyre!("refused")));
        let prober = prober_with(probe, &clock);
        let mut checks = 0;

        let outcome = prober.poll(&params, Duration::from_secs(5), || {
            checks += 1;
            if checks > 1 { Err("server exited") } else { Ok(()) }
        });

        assert!(matches!(outcome, Err(PollError::Aborted("server exited"))));
    }

    #[rstest]
    fn replacing_the_probe_keeps_clock_and_policy(params: ConnectionParams) {
        let clock = FakeClock::new();
        let prober = ReadinessProber::default()
            .with_clock(Arc::new(clock.clone()))
            .with_policy(RetryPolicy::default().with_max_attempts(2))
            .with_probe(Arc::new(failing_until(None)));

        let err = prober
            .wait_ready(&params, Duration::from_secs(60))
            .expect_err("limit reached");

        assert_eq!(err.attempts(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[rstest]
    fn postgres_probe_reports_refused_connections() {
        let port = std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .expect("ephemeral port");
        let params = ConnectionParams::new("127.0.0.1", port, "tester", "postgres");

        let err = PostgresProbe::default()
            .probe(&params, Duration::from_millis(200))
            .expect_err("nothing listens on the port");

        assert!(err.to_string().contains("failed to connect"), "{err:?}");
    }
}
