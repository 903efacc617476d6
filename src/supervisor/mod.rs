//! Launches and terminates the external `PostgreSQL` server process.
//!
//! The supervisor runs `initdb` once per data directory, spawns `postgres`
//! bound to the allocated port, and captures the server's output so
//! failures can be diagnosed after the process is gone. Termination asks for
//! a fast shutdown first and escalates to a kill when the grace period
//! lapses.

mod output;

use std::io::ErrorKind;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use color_eyre::eyre::eyre;
use tracing::{info, info_span};
use wait_timeout::ChildExt;

use self::output::{OutputBuffer, render_streams};
use crate::binaries::PgBinaries;
use crate::error::{LaunchError, LaunchErrorKind, TeardownError};
use crate::observability::LOG_TARGET;

/// How long to wait for output readers after the process exits.
const DRAIN_SETTLE_BUDGET: Duration = Duration::from_millis(500);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captures inputs for preparing and launching one server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LaunchRequest<'a> {
    /// Resolved `initdb` and `postgres` executables.
    pub binaries: &'a PgBinaries,
    /// Data directory initialised by `initdb`; also hosts the Unix socket.
    pub data_dir: &'a Utf8Path,
    /// Address the server listens on.
    pub host: &'a str,
    /// Port the server listens on.
    pub port: u16,
    /// Superuser created by `initdb`.
    pub user: &'a str,
    /// Extra `-c key=value` settings passed to the server.
    pub server_options: &'a [(String, String)],
    /// Maximum time `initdb` may run before it is killed.
    pub init_timeout: Duration,
}

/// Whether `initdb` ran or an existing cluster was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitOutcome {
    Initialised,
    Reused,
}

/// How a server process came to a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The server honoured the shutdown signal within the grace period.
    Graceful,
    /// The server had to be killed.
    Forced,
    /// The server had already exited; nothing was done.
    NotRunning,
}

/// Prepares the data directory and starts the server.
///
/// # Errors
/// Returns a [`LaunchError`] when `initdb` or the server cannot be run.
pub(crate) fn launch(request: &LaunchRequest<'_>) -> Result<ServerProcess, LaunchError> {
    initialise(request)?;
    spawn_server(request)
}

/// Runs `initdb` unless the data directory already holds a cluster.
pub(crate) fn initialise(request: &LaunchRequest<'_>) -> Result<InitOutcome, LaunchError> {
    let data_dir = request.data_dir;
    if data_dir.join("PG_VERSION").is_file() {
        info!(target: LOG_TARGET, data_dir = %data_dir, "reusing initialised data directory");
        return Ok(InitOutcome::Reused);
    }
    std::fs::create_dir_all(data_dir).map_err(|err| {
        LaunchError::new(
            LaunchErrorKind::Io,
            eyre!("failed to create data directory {data_dir}: {err}"),
        )
    })?;

    let span = info_span!(target: LOG_TARGET, "initdb", data_dir = %data_dir);
    let _entered = span.enter();
    let mut command = request.binaries.initdb_command();
    command
        .arg("-D")
        .arg(data_dir.as_std_path())
        .arg("-U")
        .arg(request.user)
        .args(["--auth=trust", "--encoding=UTF8", "--locale=C", "--no-sync"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    info!(target: LOG_TARGET, binary = %request.binaries.initdb(), "initialising data directory");

    let output = run_with_timeout(&mut command, request.init_timeout, "initdb")?;
    if !output.status.success() {
        let rendered = render_streams(&output.stdout, &output.stderr);
        return Err(LaunchError::new(
            LaunchErrorKind::InitFailed,
            eyre!("initdb exited with {}\n{rendered}", output.status),
        )
        .with_process(output.status.code(), rendered));
    }
    Ok(InitOutcome::Initialised)
}

fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
    label: &str,
) -> Result<Output, LaunchError> {
    let mut child = command.spawn().map_err(|err| spawn_error(label, &err))?;
    let waited = match child.wait_timeout(timeout) {
        Ok(waited) => waited,
        Err(err) => {
            kill_quietly(&mut child);
            return Err(LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("failed to wait for {label}: {err}"),
            ));
        }
    };
    let timed_out = waited.is_none();
    if timed_out {
        kill_quietly(&mut child);
    }
    let output = child.wait_with_output().map_err(|err| {
        LaunchError::new(
            LaunchErrorKind::Io,
            eyre!("failed to collect {label} output: {err}"),
        )
    })?;
    if timed_out {
        let rendered = render_streams(&output.stdout, &output.stderr);
        return Err(LaunchError::new(
            LaunchErrorKind::InitFailed,
            eyre!("{label} timed out after {}s\n{rendered}", timeout.as_secs()),
        )
        .with_process(None, rendered));
    }
    Ok(output)
}

fn kill_quietly(child: &mut Child) {
    if let Err(err) = child.kill() {
        // `InvalidInput` indicates the child has already exited.
        if err.kind() != ErrorKind::InvalidInput {
            tracing::warn!(target: LOG_TARGET, error = %err, "failed to kill child process");
        }
    }
}

fn spawn_error(label: &str, err: &std::io::Error) -> LaunchError {
    let kind = if err.kind() == ErrorKind::NotFound {
        LaunchErrorKind::BinaryMissing
    } else if label == "initdb" {
        LaunchErrorKind::InitFailed
    } else {
        LaunchErrorKind::StartFailed
    };
    LaunchError::new(kind, eyre!("failed to spawn {label}: {err}"))
}

/// Spawns `postgres` against an initialised data directory.
pub(crate) fn spawn_server(request: &LaunchRequest<'_>) -> Result<ServerProcess, LaunchError> {
    let mut command = request.binaries.postgres_command();
    command
        .arg("-D")
        .arg(request.data_dir.as_std_path())
        .arg("-p")
        .arg(request.port.to_string())
        .arg("-h")
        .arg(request.host)
        .arg("-k")
        .arg(request.data_dir.as_std_path());
    for (key, value) in request.server_options {
        command.arg("-c").arg(format!("{key}={value}"));
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| spawn_error("postgres", &err))?;
    let pid = child.id();
    let output = OutputBuffer::default();
    let drains = match attach_drains(&mut child, &output) {
        Ok(drains) => drains,
        Err(err) => {
            kill_quietly(&mut child);
            drop(child.wait());
            return Err(LaunchError::new(
                LaunchErrorKind::StartFailed,
                eyre!("failed to capture postgres output: {err}"),
            ));
        }
    };
    info!(
        target: LOG_TARGET,
        pid,
        port = request.port,
        data_dir = %request.data_dir,
        "spawned postgres"
    );
    Ok(ServerProcess {
        child: Some(child),
        pid,
        output,
        drains,
        exit_status: None,
    })
}

fn attach_drains(child: &mut Child, output: &OutputBuffer) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(output.drain(stdout, "stdout")?);
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(output.drain(stderr, "stderr")?);
    }
    Ok(drains)
}

/// Handle to a running server process.
///
/// The handle owns the child exclusively. Dropping it while the server still
/// runs kills the process so a forgotten handle cannot leak a server.
#[derive(Debug)]
pub(crate) struct ServerProcess {
    child: Option<Child>,
    pid: u32,
    output: OutputBuffer,
    drains: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl ServerProcess {
    pub(crate) const fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the captured output, truncated for diagnostics.
    pub(crate) fn output(&self) -> String {
        self.output.rendered()
    }

    pub(crate) fn is_running(&mut self) -> bool {
        matches!(self.try_exit_status(), Ok(None))
    }

    /// Reports the exit status without blocking, reaping the child once it
    /// has exited.
    pub(crate) fn try_exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait()?;
        if let Some(status) = status {
            self.finish(status);
        }
        Ok(status)
    }

    /// Fails with a [`LaunchError`] when the server has already exited.
    pub(crate) fn ensure_running(&mut self) -> Result<(), LaunchError> {
        match self.try_exit_status() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(self.exited_error(status)),
            Err(err) => Err(LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("failed to poll postgres process {}: {err}", self.pid),
            )),
        }
    }

    fn exited_error(&self, status: ExitStatus) -> LaunchError {
        let output = self.output();
        let kind = if is_address_in_use(&output) {
            LaunchErrorKind::AddressInUse
        } else {
            LaunchErrorKind::ServerExited
        };
        LaunchError::new(
            kind,
            eyre!("postgres exited before accepting connections ({status})\n{output}"),
        )
        .with_process(status.code(), output)
    }

    /// Requests a fast shutdown and kills the server if it outlives `grace`.
    ///
    /// Calling this on a server that has already stopped is a no-op.
    pub(crate) fn terminate(&mut self, grace: Duration) -> Result<Termination, TeardownError> {
        let Some(mut child) = self.child.take() else {
            return Ok(Termination::NotRunning);
        };
        if let Ok(Some(status)) = child.try_wait() {
            self.finish(status);
            return Ok(Termination::NotRunning);
        }

        if let Err(err) = request_fast_shutdown(self.pid) {
            tracing::warn!(
                target: LOG_TARGET,
                pid = self.pid,
                error = %err,
                "failed to signal postgres; killing instead"
            );
            return self.force_kill(child);
        }

        match child.wait_timeout(grace) {
            Ok(Some(status)) => {
                info!(target: LOG_TARGET, pid = self.pid, %status, "postgres stopped");
                self.finish(status);
                Ok(Termination::Graceful)
            }
            Ok(None) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    pid = self.pid,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "postgres outlived its shutdown grace period; killing"
                );
                self.force_kill(child)
            }
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    pid = self.pid,
                    error = %err,
                    "failed to wait for postgres shutdown; killing"
                );
                self.force_kill(child)
            }
        }
    }

    /// Kills the server immediately.
    pub(crate) fn kill(&mut self) -> Result<Termination, TeardownError> {
        let Some(mut child) = self.child.take() else {
            return Ok(Termination::NotRunning);
        };
        if let Ok(Some(status)) = child.try_wait() {
            self.finish(status);
            return Ok(Termination::NotRunning);
        }
        self.force_kill(child)
    }

    fn force_kill(&mut self, mut child: Child) -> Result<Termination, TeardownError> {
        if let Err(err) = child.kill() {
            if err.kind() != ErrorKind::InvalidInput {
                let pid = self.pid;
                self.child = Some(child);
                return Err(TeardownError::from(eyre!(
                    "failed to kill postgres process {pid}: {err}"
                )));
            }
        }
        match child.wait() {
            Ok(status) => {
                self.finish(status);
                Ok(Termination::Forced)
            }
            Err(err) => Err(TeardownError::from(eyre!(
                "failed to reap postgres process {}: {err}",
                self.pid
            ))),
        }
    }

    fn finish(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.child = None;
        self.settle_drains();
    }

    // Orphaned backends may keep the pipes open, so readers get a bounded
    // window to flush before they are detached.
    fn settle_drains(&mut self) {
        let started = Instant::now();
        while !self.drains.iter().all(JoinHandle::is_finished)
            && started.elapsed() < DRAIN_SETTLE_BUDGET
        {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        for handle in self.drains.drain(..) {
            if handle.is_finished() {
                drop(handle.join());
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.child.is_none() {
            return;
        }
        tracing::warn!(
            target: LOG_TARGET,
            pid = self.pid,
            "server handle dropped while postgres was running; killing"
        );
        if let Err(err) = self.kill() {
            tracing::warn!(target: LOG_TARGET, error = %err, "failed to kill postgres on drop");
        }
    }
}

fn is_address_in_use(output: &str) -> bool {
    output.contains("Address already in use")
}

#[cfg(unix)]
fn request_fast_shutdown(pid: u32) -> Result<(), TeardownError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|err| TeardownError::from(eyre!("pid {pid} out of range: {err}")))?;
    // SIGINT selects PostgreSQL's "fast" shutdown mode.
    kill(Pid::from_raw(raw), Signal::SIGINT)
        .map_err(|err| TeardownError::from(eyre!("failed to send SIGINT to {pid}: {err}")))
}

#[cfg(not(unix))]
fn request_fast_shutdown(pid: u32) -> Result<(), TeardownError> {
    Err(TeardownError::from(eyre!(
        "graceful shutdown of {pid} is unsupported on this platform"
    )))
}
