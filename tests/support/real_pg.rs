//! Starts real `PostgreSQL` instances, soft-skipping when the environment
//! cannot run them.

use color_eyre::eyre::Result;
use tiny_postgres::test_support::skip_reason;
use tiny_postgres::{Instance, InstanceConfig, Launcher};

/// Starts an instance or returns `None` after printing why the test skips.
pub fn start_or_skip(launcher: &Launcher, config: &InstanceConfig) -> Result<Option<Instance>> {
    match launcher.start(config) {
        Ok(instance) => Ok(Some(instance)),
        Err(err) => {
            if let Some(reason) = skip_reason(&err) {
                eprintln!("{reason}");
                return Ok(None);
            }
            Err(err.into())
        }
    }
}
