//! Async lifecycle entry points for `#[tokio::test]` contexts.
//!
//! Start-up and teardown block on child processes, so both run on Tokio's
//! blocking pool. A dropped `start_async` future still tears the instance
//! down: the blocking task finishes and its unclaimed result is dropped.

use color_eyre::eyre::eyre;
use tokio::task::{JoinError, spawn_blocking};
use tracing::Instrument;

use super::{Instance, Launcher};
use crate::config::InstanceConfig;
use crate::error::{LaunchError, LaunchErrorKind, Result, TeardownError};

impl Launcher {
    /// Async variant of [`Launcher::start`].
    ///
    /// # Errors
    /// See [`Launcher::start`].
    ///
    /// # Examples
    /// ```no_run
    /// use tiny_postgres::{InstanceConfig, Launcher};
    ///
    /// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
    /// let instance = Launcher::new().start_async(&InstanceConfig::default()).await?;
    /// println!("{}", instance.url());
    /// instance.stop_async().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_async(&self, config: &InstanceConfig) -> Result<Instance> {
        let launcher = self.clone();
        let config = config.clone();
        let span = tracing::Span::current();
        let task = spawn_blocking(move || span.in_scope(|| launcher.start(&config)));
        match task.in_current_span().await {
            Ok(result) => result,
            Err(err) => Err(LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("instance start task failed: {}", join_failure(err)),
            )
            .into()),
        }
    }
}

impl Instance {
    /// Async variant of [`Instance::stop`].
    ///
    /// # Errors
    /// See [`Instance::stop`].
    pub async fn stop_async(self) -> std::result::Result<(), TeardownError> {
        match spawn_blocking(move || self.stop()).await {
            Ok(result) => result,
            Err(err) => Err(TeardownError::from(eyre!(
                "instance stop task failed: {}",
                join_failure(err)
            ))),
        }
    }
}

/// Starts an instance on the blocking pool with a fresh launcher.
///
/// # Errors
/// See [`Launcher::start`].
pub async fn start_async(config: &InstanceConfig) -> Result<Instance> {
    Launcher::new().start_async(config).await
}

// Panics inside the blocking task resume on the caller so test failures keep
// their original message.
fn join_failure(err: JoinError) -> JoinError {
    match err.try_into_panic() {
        Ok(payload) => std::panic::resume_unwind(payload),
        Err(err) => err,
    }
}
