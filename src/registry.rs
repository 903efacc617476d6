//! Explicit registry of live instances.
//!
//! The registry is an ordinary value handed to the [`Launcher`](crate::Launcher)
//! rather than a module-level singleton. Cloning it shares the underlying map,
//! so every launcher built from the same registry sees the same reservations.
//!
//! # Lifecycle
//!
//! - **Init**: create one with [`InstanceRegistry::new`] (or `Default`) and
//!   pass clones to each launcher that should share port bookkeeping.
//! - **Use**: the port allocator reserves ports through [`PortLease`] values;
//!   the launcher records the server PID and data directory once the server
//!   is spawned. Instances release their entry during teardown.
//! - **Teardown**: normally nothing is left behind. After a crash or a leaked
//!   instance, [`InstanceRegistry::reap`] force-kills recorded processes and
//!   removes their data directories.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::data_dir::{RemovalOutcome, try_remove_dir_all};
use crate::observability::LOG_TARGET;

/// What the registry knows about one reserved port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceRecord {
    /// PID of the server process once it has been spawned.
    pub pid: Option<u32>,
    /// Data directory backing the instance once it has been created.
    pub data_dir: Option<Utf8PathBuf>,
    /// Whether the data directory should be removed during reaping.
    pub remove_data: bool,
}

#[derive(Debug)]
struct Slot {
    lease: u64,
    record: InstanceRecord,
}

/// Shared record of ports held by live instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    entries: Arc<DashMap<u16, Slot>>,
    next_lease: Arc<AtomicU64>,
}

impl InstanceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `port`, returning `None` when another instance holds it.
    pub(crate) fn try_reserve(&self, port: u16) -> Option<PortLease> {
        match self.entries.entry(port) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot {
                    lease,
                    record: InstanceRecord::default(),
                });
                Some(PortLease {
                    port,
                    lease,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Records the server process and data directory behind `port`.
    pub(crate) fn record_launch(
        &self,
        port: u16,
        pid: u32,
        data_dir: &Utf8Path,
        remove_data: bool,
    ) {
        if let Some(mut slot) = self.entries.get_mut(&port) {
            slot.record.pid = Some(pid);
            slot.record.data_dir = Some(data_dir.to_owned());
            slot.record.remove_data = remove_data;
        }
    }

    /// Forgets the PID recorded for `port` once its process has exited.
    pub(crate) fn clear_pid(&self, port: u16) {
        if let Some(mut slot) = self.entries.get_mut(&port) {
            slot.record.pid = None;
        }
    }

    // A lease only releases its own reservation; after `reap` the port may
    // already belong to a newer lease.
    fn release(&self, port: u16, lease: u64) {
        self.entries.remove_if(&port, |_, slot| slot.lease == lease);
    }

    /// Returns `true` when `port` is held by a live instance.
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.entries.contains_key(&port)
    }

    /// Returns the record stored for `port`, if any.
    #[must_use]
    pub fn record(&self, port: u16) -> Option<InstanceRecord> {
        self.entries.get(&port).map(|slot| slot.record.clone())
    }

    /// Returns the reserved ports in ascending order.
    #[must_use]
    pub fn live_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.entries.iter().map(|entry| *entry.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Returns the number of live reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no instance holds a reservation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Force-kills every recorded server process, removes disposable data
    /// directories, and clears the registry.
    ///
    /// Intended for crash recovery when instances were leaked instead of
    /// dropped. Returns the number of entries reaped.
    pub fn reap(&self) -> usize {
        let ports = self.live_ports();
        let mut reaped = 0;
        for port in ports {
            let Some((_, slot)) = self.entries.remove(&port) else {
                continue;
            };
            reap_record(port, &slot.record);
            reaped += 1;
        }
        reaped
    }
}

fn reap_record(port: u16, record: &InstanceRecord) {
    if let Some(pid) = record.pid {
        kill_pid(pid);
    }
    let Some(data_dir) = record.data_dir.as_ref().filter(|_| record.remove_data) else {
        return;
    };
    match try_remove_dir_all(data_dir.as_std_path()) {
        Ok(RemovalOutcome::Removed) => tracing::info!(
            target: LOG_TARGET,
            port,
            path = %data_dir,
            "reaped data directory"
        ),
        Ok(RemovalOutcome::Missing) => {}
        Err(err) => tracing::warn!(
            target: LOG_TARGET,
            port,
            path = %data_dir,
            error = %err,
            "failed to remove data directory while reaping"
        ),
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => tracing::info!(target: LOG_TARGET, pid, "reaped server process"),
        Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!(
            target: LOG_TARGET,
            pid,
            error = %err,
            "failed to kill server process while reaping"
        ),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    tracing::warn!(
        target: LOG_TARGET,
        pid,
        "cannot reap server process on this platform"
    );
}

/// Reservation of a port in an [`InstanceRegistry`].
///
/// The reservation is released when the lease drops.
#[derive(Debug)]
#[must_use = "dropping the lease releases the port reservation"]
pub struct PortLease {
    port: u16,
    lease: u64,
    registry: InstanceRegistry,
}

impl PortLease {
    /// Returns the reserved port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the registry holding the reservation.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry.release(self.port, self.lease);
    }
}
