//! Orchestrates allocate, launch, probe and teardown for one instance.
//!
//! [`Launcher::start`] walks an instance through its [`InstanceState`]s and
//! hands back a ready [`Instance`]. Any failure on the way tears down what
//! was created so far (the server process, the data directory and the port
//! reservation) before the original error is returned.

#[cfg(feature = "async-api")]
mod async_api;
mod instance;
mod state;

use std::sync::Arc;

use tracing::{Span, field, info, info_span, warn};

#[cfg(feature = "async-api")]
pub use self::async_api::start_async;
pub use self::instance::{Instance, InstanceStatus};
pub use self::state::{IllegalTransition, InstanceState};
use crate::binaries::PgBinaries;
use crate::config::InstanceConfig;
use crate::connection::ConnectionParams;
use crate::data_dir::DataDir;
use crate::error::{LaunchErrorKind, Result, TinyPgError};
use crate::observability::LOG_TARGET;
use crate::port::PortAllocator;
use crate::readiness::{Clock, PollError, Probe, Readiness, ReadinessProber};
use crate::registry::{InstanceRegistry, PortLease};
use crate::supervisor::{self, LaunchRequest, ServerProcess};

/// Starts instances that share one [`InstanceRegistry`].
///
/// Instances started from clones of a launcher never receive the same port
/// while both are alive.
///
/// # Examples
/// ```no_run
/// use tiny_postgres::{InstanceConfig, Launcher};
///
/// # fn main() -> tiny_postgres::Result<()> {
/// let launcher = Launcher::new();
/// let first = launcher.start(&InstanceConfig::default())?;
/// let second = launcher.start(&InstanceConfig::default())?;
/// assert_ne!(first.port(), second.port());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Launcher {
    registry: InstanceRegistry,
    prober: ReadinessProber,
}

impl Launcher {
    /// Creates a launcher with its own registry and the `postgres` probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares `registry` with other launchers.
    #[must_use]
    pub fn with_registry(mut self, registry: InstanceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the readiness probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.prober = self.prober.with_probe(probe);
        self
    }

    /// Replaces the clock used while waiting for readiness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.prober = self.prober.with_clock(clock);
        self
    }

    /// Returns the registry recording this launcher's instances.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Starts a server and waits until it accepts connections.
    ///
    /// # Errors
    /// - [`TinyPgError::Config`] when `config` is invalid.
    /// - [`TinyPgError::Allocation`] when no port could be reserved.
    /// - [`TinyPgError::Launch`] when the binaries are missing or the server
    ///   fails to initialise or start.
    /// - [`TinyPgError::Timeout`] when the server did not become ready within
    ///   `config.start_timeout`.
    pub fn start(&self, config: &InstanceConfig) -> Result<Instance> {
        let span = info_span!(
            target: LOG_TARGET,
            "instance",
            port = field::Empty,
            data_dir = field::Empty
        );
        let mut state = InstanceState::Allocating;
        let outcome = {
            let _entered = span.enter();
            self.start_in(config, &mut state, &span)
        };
        outcome.map_err(|err| {
            let _entered = span.enter();
            let from = state;
            if let Err(illegal) = state.transition(InstanceState::Failed) {
                warn!(target: LOG_TARGET, error = %illegal, "ignoring state change");
            }
            warn!(target: LOG_TARGET, %from, error = %err, "instance failed to start");
            err
        })
    }

    /// Runs `action` against a fresh instance and tears it down afterwards.
    ///
    /// Teardown failures are logged rather than returned, so the value
    /// produced by `action` is never masked.
    ///
    /// # Errors
    /// Returns the start-up errors described in [`start`](Self::start).
    pub fn with_instance<F, R>(&self, config: &InstanceConfig, action: F) -> Result<R>
    where
        F: FnOnce(&mut Instance) -> R,
    {
        let mut instance = self.start(config)?;
        let output = action(&mut instance);
        drop(instance);
        Ok(output)
    }

    fn start_in(
        &self,
        config: &InstanceConfig,
        state: &mut InstanceState,
        span: &Span,
    ) -> Result<Instance> {
        config.validate()?;
        let binaries = PgBinaries::discover(config.bin_dir.as_deref())?;
        let allocator = PortAllocator::new(self.registry.clone()).with_host(config.host.clone());
        let lease = match config.port {
            Some(port) => allocator.reserve(port)?,
            None => allocator.allocate()?,
        };
        advance(state, InstanceState::Starting);

        let data_dir = match &config.data_dir {
            Some(path) => DataDir::at(path, config.keep_data)?,
            None => DataDir::temporary(config.keep_data)?,
        };
        span.record("data_dir", field::display(data_dir.path()));

        let started =
            self.launch_until_ready(config, &binaries, &data_dir, &allocator, lease, span)?;
        advance(state, InstanceState::Ready);
        info!(
            target: LOG_TARGET,
            port = started.params.port(),
            pid = started.server.pid(),
            attempts = started.readiness.attempts(),
            "instance ready"
        );
        Ok(Instance::ready(
            started.server,
            data_dir,
            started.lease,
            started.params,
            config.shutdown_timeout,
            started.readiness,
            span.clone(),
        ))
    }

    fn launch_until_ready(
        &self,
        config: &InstanceConfig,
        binaries: &PgBinaries,
        data_dir: &DataDir,
        allocator: &PortAllocator,
        mut lease: PortLease,
        span: &Span,
    ) -> Result<Started> {
        let prober = self.prober.clone().with_policy(config.retry_policy);
        let mut attempt = 1;
        loop {
            let port = lease.port();
            span.record("port", port);
            let request = LaunchRequest {
                binaries,
                data_dir: data_dir.path(),
                host: &config.host,
                port,
                user: &config.user,
                server_options: &config.server_options,
                init_timeout: config.init_timeout,
            };
            let mut server = {
                let launch_span = info_span!(target: LOG_TARGET, "launch", port, attempt);
                let _entered = launch_span.enter();
                supervisor::launch(&request)?
            };
            self.registry
                .record_launch(port, server.pid(), data_dir.path(), data_dir.is_disposable());
            let params = ConnectionParams::new(
                config.host.clone(),
                port,
                config.user.clone(),
                config.database.clone(),
            );

            match prober.poll(&params, config.start_timeout, || server.ensure_running()) {
                Ok(readiness) => {
                    return Ok(Started {
                        server,
                        lease,
                        params,
                        readiness,
                    });
                }
                Err(PollError::Aborted(err))
                    if err.kind() == LaunchErrorKind::AddressInUse
                        && config.port.is_none()
                        && attempt < config.port_attempts =>
                {
                    warn!(
                        target: LOG_TARGET,
                        port,
                        attempt,
                        "port was taken before the server could bind it; retrying with a fresh port"
                    );
                    self.registry.clear_pid(port);
                    lease = allocator.allocate()?;
                    attempt += 1;
                }
                Err(PollError::Aborted(err)) => return Err(err.into()),
                Err(PollError::Timeout(err)) => {
                    stop_unready(&mut server, config);
                    return Err(TinyPgError::from(err.with_output(server.output())));
                }
            }
        }
    }
}

struct Started {
    server: ServerProcess,
    lease: PortLease,
    params: ConnectionParams,
    readiness: Readiness,
}

fn stop_unready(server: &mut ServerProcess, config: &InstanceConfig) {
    if let Err(err) = server.terminate(config.shutdown_timeout) {
        warn!(
            target: LOG_TARGET,
            pid = server.pid(),
            error = %err,
            "failed to stop server that never became ready"
        );
    }
}

fn advance(state: &mut InstanceState, next: InstanceState) {
    if let Err(err) = state.transition(next) {
        warn!(target: LOG_TARGET, error = %err, "ignoring state change");
    }
}

/// Starts an instance with a launcher that has its own registry.
///
/// Use a shared [`Launcher`] when several instances must coexist.
///
/// # Errors
/// See [`Launcher::start`].
pub fn start(config: &InstanceConfig) -> Result<Instance> {
    Launcher::new().start(config)
}

/// Runs `action` against a fresh instance, tearing it down afterwards.
///
/// # Examples
/// ```no_run
/// use tiny_postgres::{InstanceConfig, with_instance};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let rows = with_instance(&InstanceConfig::default(), |instance| {
///     let mut client = instance.connection().to_client_config().connect(postgres::NoTls)?;
///     client.query("SELECT 1", &[]).map(|rows| rows.len())
/// })??;
/// assert_eq!(rows, 1);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
/// See [`Launcher::start`].
pub fn with_instance<F, R>(config: &InstanceConfig, action: F) -> Result<R>
where
    F: FnOnce(&mut Instance) -> R,
{
    Launcher::new().with_instance(config, action)
}
