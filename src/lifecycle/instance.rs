//! Running instances and their teardown.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{Span, info, warn};

use super::state::InstanceState;
use crate::connection::ConnectionParams;
use crate::data_dir::DataDir;
use crate::error::TeardownError;
use crate::observability::LOG_TARGET;
use crate::readiness::Readiness;
use crate::registry::PortLease;
use crate::supervisor::{ServerProcess, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Graceful,
    Kill,
}

/// Snapshot of an instance, as printed by the command-line tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Server PID while the process is alive.
    pub pid: Option<u32>,
    /// Port the server listens on.
    pub port: u16,
    /// Data directory backing the server.
    pub data_dir: Utf8PathBuf,
    /// Whether the server process is alive.
    pub running: bool,
    /// Connection URL for the default database.
    pub url: String,
}

/// A ready server bound to a Rust scope.
///
/// Dropping the instance stops the server and removes its data directory
/// (unless [`keep_data`](Self::keep_data) was requested). Teardown runs
/// exactly once whether it is triggered by [`stop`](Self::stop),
/// [`kill`](Self::kill) or `Drop`, including during a panic unwind.
///
/// # Examples
/// ```no_run
/// use tiny_postgres::{InstanceConfig, Launcher};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let instance = Launcher::new().start(&InstanceConfig::default())?;
/// let mut client = instance.connection().to_client_config().connect(postgres::NoTls)?;
/// client.batch_execute("CREATE TABLE t (id int)")?;
/// instance.stop()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Instance {
    state: InstanceState,
    server: ServerProcess,
    data_dir: DataDir,
    lease: Option<PortLease>,
    params: ConnectionParams,
    shutdown_timeout: Duration,
    readiness: Readiness,
    span: Span,
}

impl Instance {
    pub(super) fn ready(
        server: ServerProcess,
        data_dir: DataDir,
        lease: PortLease,
        params: ConnectionParams,
        shutdown_timeout: Duration,
        readiness: Readiness,
        span: Span,
    ) -> Self {
        Self {
            state: InstanceState::Ready,
            server,
            data_dir,
            lease: Some(lease),
            params,
            shutdown_timeout,
            readiness,
            span,
        }
    }

    /// Returns how to connect to the server.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionParams {
        &self.params
    }

    /// Returns the connection URL for the default database.
    #[must_use]
    pub fn url(&self) -> String {
        self.params.url()
    }

    /// Returns the port the server listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.params.port()
    }

    /// Returns the data directory backing the server.
    #[must_use]
    pub fn data_dir(&self) -> &Utf8Path {
        self.data_dir.path()
    }

    /// Returns the server PID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.server.pid()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Returns how long the server took to accept connections.
    #[must_use]
    pub const fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// Returns the server output captured so far.
    #[must_use]
    pub fn server_output(&self) -> String {
        self.server.output()
    }

    /// Leaves the data directory on disk after teardown.
    pub fn keep_data(&mut self) {
        self.data_dir.keep();
        if let Some(lease) = &self.lease {
            lease
                .registry()
                .record_launch(lease.port(), self.server.pid(), self.data_dir.path(), false);
        }
    }

    /// Reports whether the server is still alive.
    pub fn status(&mut self) -> InstanceStatus {
        let running = self.server.is_running();
        InstanceStatus {
            state: self.state,
            pid: running.then(|| self.server.pid()),
            port: self.port(),
            data_dir: self.data_dir.path().to_owned(),
            running,
            url: self.url(),
        }
    }

    /// Shuts the server down gracefully and removes the data directory.
    ///
    /// # Errors
    /// Returns [`TeardownError`] when the process could not be stopped or the
    /// directory could not be removed. Teardown still runs to completion.
    pub fn stop(mut self) -> Result<(), TeardownError> {
        self.teardown(StopMode::Graceful)
    }

    /// Kills the server immediately and removes the data directory.
    ///
    /// # Errors
    /// Returns [`TeardownError`] when the process could not be killed or the
    /// directory could not be removed.
    pub fn kill(mut self) -> Result<(), TeardownError> {
        self.teardown(StopMode::Kill)
    }

    fn teardown(&mut self, mode: StopMode) -> Result<(), TeardownError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let span = self.span.clone();
        let _entered = span.enter();
        self.advance(InstanceState::Terminating);

        let stopped = match mode {
            StopMode::Graceful => self.server.terminate(self.shutdown_timeout),
            StopMode::Kill => self.server.kill(),
        };
        let stop_error = match stopped {
            Ok(termination) => {
                self.advance(InstanceState::Terminated);
                log_termination(termination, self.server.pid());
                None
            }
            Err(err) => {
                self.advance(InstanceState::Failed);
                Some(err)
            }
        };

        let removed = self.data_dir.remove();
        if let Some(lease) = self.lease.take() {
            lease.registry().clear_pid(lease.port());
        }
        match (stop_error, removed) {
            (Some(err), Err(removal)) => {
                warn!(target: LOG_TARGET, error = %removal, "data directory cleanup failed");
                Err(err)
            }
            (Some(err), Ok(())) | (None, Err(err)) => Err(err),
            (None, Ok(())) => Ok(()),
        }
    }

    fn advance(&mut self, next: InstanceState) {
        if let Err(err) = self.state.transition(next) {
            warn!(target: LOG_TARGET, error = %err, "ignoring state change");
        }
    }
}

fn log_termination(termination: Termination, pid: u32) {
    match termination {
        Termination::Graceful => info!(target: LOG_TARGET, pid, "instance stopped"),
        Termination::Forced => info!(target: LOG_TARGET, pid, "instance killed"),
        Termination::NotRunning => {
            warn!(target: LOG_TARGET, pid, "server had already exited before teardown");
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Err(err) = self.teardown(StopMode::Graceful) {
            warn!(
                target: LOG_TARGET,
                port = self.params.port(),
                error = %err,
                "instance teardown failed"
            );
        }
    }
}
