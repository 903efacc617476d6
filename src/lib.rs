//! Disposable `PostgreSQL` servers for tests.
//!
//! The crate drives a locally installed `PostgreSQL` distribution: it
//! reserves a free port, initialises a private data directory with `initdb`,
//! starts `postgres`, waits until the server answers `SELECT 1`, and hands
//! back an [`Instance`] whose lifetime bounds the server. Dropping the
//! instance stops the process and removes the data directory.
//!
//! ```no_run
//! use tiny_postgres::{InstanceConfig, with_instance};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! with_instance(&InstanceConfig::default(), |instance| {
//!     println!("connect to {}", instance.url());
//! })?;
//! # Ok(())
//! # }
//! ```

mod binaries;
mod config;
mod connection;
mod data_dir;
mod error;
mod lifecycle;
mod observability;
mod port;
mod readiness;
mod registry;
mod supervisor;
#[doc(hidden)]
pub mod test_support;

pub use binaries::PgBinaries;
pub use config::{
    DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_INIT_TIMEOUT, DEFAULT_PORT_ATTEMPTS,
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_START_TIMEOUT, InstanceConfig, TinyPgEnvCfg,
    timeout_from_secs,
};
pub use connection::ConnectionParams;
pub use error::{
    AllocationError, ConfigError, ConfigResult, LaunchError, LaunchErrorKind, Result,
    TeardownError, TimeoutError, TinyPgError, TinyPgError as Error,
};
#[cfg(feature = "async-api")]
pub use lifecycle::start_async;
pub use lifecycle::{
    IllegalTransition, Instance, InstanceState, InstanceStatus, Launcher, start, with_instance,
};
pub use port::{DEFAULT_ALLOCATION_ATTEMPTS, PortAllocator};
pub use readiness::{
    Clock, PostgresProbe, Probe, Readiness, ReadinessProber, RetryPolicy, SystemClock,
};
pub use registry::{InstanceRecord, InstanceRegistry, PortLease};
