//! Helpers shared by unit and integration tests.
//!
//! The module is public so integration tests and downstream suites can reuse
//! the fake clock, fake installations and skip heuristics. It is not part of
//! the supported API.

mod clock;
mod fake_install;
mod logging;
mod skip;

pub use clock::FakeClock;
pub use fake_install::{FAKE_INITDB_OK, FAKE_POSTGRES_HANG, FakeInstallation};
pub use logging::capture_warn_logs;
pub use skip::{SKIP_TINY_POSTGRES_PREFIX, format_skip_reason, skip_reason};
