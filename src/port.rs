//! Port allocation for ephemeral instances.
//!
//! Ports come from the operating system: the allocator binds a listener to
//! port `0`, reads back the assigned number and releases the socket straight
//! away. Each candidate is then reserved in the [`InstanceRegistry`] so two
//! live instances sharing a registry never receive the same port.

use std::net::TcpListener;

use color_eyre::eyre::eyre;

use crate::error::AllocationError;
use crate::observability::LOG_TARGET;
use crate::registry::{InstanceRegistry, PortLease};

/// Number of candidates requested from the OS before allocation gives up.
pub const DEFAULT_ALLOCATION_ATTEMPTS: usize = 16;

/// Hands out free ports reserved in an [`InstanceRegistry`].
///
/// # Examples
/// ```
/// use tiny_postgres::{InstanceRegistry, PortAllocator};
///
/// # fn main() -> Result<(), tiny_postgres::AllocationError> {
/// let registry = InstanceRegistry::new();
/// let lease = PortAllocator::new(registry.clone()).allocate()?;
/// assert!(registry.is_reserved(lease.port()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PortAllocator {
    registry: InstanceRegistry,
    host: String,
    attempts: usize,
}

impl PortAllocator {
    /// Creates an allocator binding probes on the IPv4 loopback interface.
    #[must_use]
    pub fn new(registry: InstanceRegistry) -> Self {
        Self {
            registry,
            host: "127.0.0.1".to_owned(),
            attempts: DEFAULT_ALLOCATION_ATTEMPTS,
        }
    }

    /// Probes ports on `host` instead of the loopback interface.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Overrides how many candidates are tried before giving up.
    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Obtains a free port from the OS and reserves it.
    ///
    /// # Errors
    /// Returns [`AllocationError`] when no candidate could be bound or every
    /// candidate was already reserved by a live instance.
    pub fn allocate(&self) -> Result<PortLease, AllocationError> {
        self.allocate_with(|| ephemeral_port(&self.host))
    }

    /// Reserves a caller-chosen port.
    ///
    /// The port is not probed: the server start reports a clash with another
    /// process, while clashes between instances are caught here.
    ///
    /// # Errors
    /// Returns [`AllocationError`] when the port is `0` or already reserved.
    pub fn reserve(&self, port: u16) -> Result<PortLease, AllocationError> {
        if port == 0 {
            return Err(AllocationError::from(eyre!(
                "port 0 cannot be reserved; omit the port to allocate one"
            )));
        }
        self.registry.try_reserve(port).ok_or_else(|| {
            AllocationError::from(eyre!("port {port} is already held by a live instance"))
        })
    }

    pub(crate) fn allocate_with<F>(&self, mut next_port: F) -> Result<PortLease, AllocationError>
    where
        F: FnMut() -> std::io::Result<u16>,
    {
        let mut last_failure = String::from("no attempts made");
        for attempt in 1..=self.attempts {
            match next_port() {
                Ok(port) => {
                    if let Some(lease) = self.registry.try_reserve(port) {
                        tracing::debug!(target: LOG_TARGET, port, attempt, "allocated port");
                        return Ok(lease);
                    }
                    last_failure = format!("port {port} already held by a live instance");
                }
                Err(err) => last_failure = format!("failed to bind {}:0: {err}", self.host),
            }
            tracing::debug!(
                target: LOG_TARGET,
                attempt,
                reason = %last_failure,
                "port candidate rejected"
            );
        }
        Err(AllocationError::from(eyre!(
            "no free port after {} attempt(s): {last_failure}",
            self.attempts
        )))
    }
}

fn ephemeral_port(host: &str) -> std::io::Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
