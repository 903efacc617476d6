//! Probe double that never sees a ready server.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use color_eyre::Report;
use color_eyre::eyre::eyre;
use tiny_postgres::{ConnectionParams, Probe};

/// Refuses every probe and counts the attempts.
#[derive(Debug, Default)]
pub struct NeverReady {
    calls: AtomicU32,
}

impl NeverReady {
    /// Returns how many probes were made.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Probe for NeverReady {
    fn probe(&self, params: &ConnectionParams, _budget: Duration) -> Result<(), Report> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(eyre!(
            "connection to port {} refused (attempt {attempt})",
            params.port()
        ))
    }
}
