//! Domain error types for the tiny `PostgreSQL` supervisor.
//!
//! Each failure class named by the lifecycle (allocation, launch, readiness
//! and teardown) has its own type so callers can branch on structured errors,
//! while [`TinyPgError`] gathers the ones that abort a start request.

use std::time::Duration;

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return a [`TinyPgError`].
pub type Result<T> = std::result::Result<T, TinyPgError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum TinyPgError {
    /// No usable port could be reserved for the instance.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The server binaries are missing or failed to initialise or start.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The server never accepted connections within the start budget.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// The supplied configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Captures port allocation failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct AllocationError(#[from] Report);

/// Categorises launch failures so callers can branch on structured errors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum LaunchErrorKind {
    /// Represents I/O errors without a more specific semantic meaning.
    #[default]
    Io,
    /// The `initdb` or `postgres` executable could not be found.
    BinaryMissing,
    /// `initdb` exited unsuccessfully or timed out.
    InitFailed,
    /// The server process could not be spawned.
    StartFailed,
    /// The server process exited before it became ready.
    ServerExited,
    /// The server exited because its listening address was already taken.
    AddressInUse,
}

/// Captures failures to prepare or start the server process.
///
/// The exit code and captured output of the failing command are kept so the
/// diagnostics survive after the process is gone.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct LaunchError {
    kind: LaunchErrorKind,
    exit_code: Option<i32>,
    output: String,
    #[source]
    report: Report,
}

impl LaunchError {
    /// Constructs a launch error without process diagnostics.
    #[must_use]
    pub fn new(kind: LaunchErrorKind, report: Report) -> Self {
        Self {
            kind,
            exit_code: None,
            output: String::new(),
            report,
        }
    }

    /// Attaches the exit code and captured output of the failed command.
    #[must_use]
    pub fn with_process(mut self, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        self.exit_code = exit_code;
        self.output = output.into();
        self
    }

    /// Returns the semantic category for this launch failure.
    #[must_use]
    pub const fn kind(&self) -> LaunchErrorKind {
        self.kind
    }

    /// Returns the raw exit code of the failed command, when it exited.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Returns the output captured from the failed command.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<std::io::Error> for LaunchError {
    fn from(err: std::io::Error) -> Self {
        Self::new(LaunchErrorKind::Io, Report::new(err))
    }
}

/// Raised when the server did not answer a probe within the start budget.
///
/// The error of the final probe attempt is kept as the source and the server
/// output captured up to that point is rendered with the message.
#[derive(Debug, Error)]
#[error(
    "server did not become ready within {timeout:?} after {attempts} attempt(s): {last_error}{}",
    output_suffix(.output)
)]
pub struct TimeoutError {
    timeout: Duration,
    attempts: u32,
    output: String,
    #[source]
    last_error: Report,
}

impl TimeoutError {
    pub(crate) const fn new(timeout: Duration, attempts: u32, last_error: Report) -> Self {
        Self {
            timeout,
            attempts,
            output: String::new(),
            last_error,
        }
    }

    /// Attaches the server output captured before the probe gave up.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Returns the readiness budget that elapsed.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns how many probe attempts were made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the server output captured before the probe gave up.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Returns the error reported by the final probe attempt.
    #[must_use]
    pub const fn last_error(&self) -> &Report {
        &self.last_error
    }
}

fn output_suffix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("\nserver output:\n{output}")
    }
}

/// Captures best-effort teardown failures.
///
/// Teardown errors are logged by scoped cleanup and only surface when a
/// caller stops an instance explicitly.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TeardownError(#[from] Report);

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn timeout_error_renders_output_when_present() {
        let err = TimeoutError::new(Duration::from_secs(2), 7, eyre!("connection refused"))
            .with_output("FATAL: lock file exists");
        let message = err.to_string();

        assert!(message.contains("after 7 attempt(s)"), "{message}");
        assert!(message.contains("connection refused"), "{message}");
        assert!(message.contains("server output:\nFATAL: lock file exists"), "{message}");
    }

    #[test]
    fn timeout_error_omits_empty_output() {
        let err = TimeoutError::new(Duration::from_millis(10), 1, eyre!("refused"));

        assert!(!err.to_string().contains("server output"));
    }

    #[test]
    fn launch_error_keeps_process_diagnostics() {
        let err = LaunchError::new(LaunchErrorKind::InitFailed, eyre!("initdb failed"))
            .with_process(Some(1), "boom");

        assert_eq!(err.kind(), LaunchErrorKind::InitFailed);
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.output(), "boom");
        assert_eq!(err.to_string(), "initdb failed");
    }

    #[test]
    fn io_errors_map_to_io_kind() {
        let err = LaunchError::from(std::io::Error::other("disk full"));

        assert_eq!(err.kind(), LaunchErrorKind::Io);
    }
}
