//! Shared tracing configuration for lifecycle instrumentation.
//!
//! Centralises the log target used by the crate so subscribers can filter
//! supervisor events without pulling in unrelated application logs.

/// Target used by lifecycle spans and logs.
pub(crate) const LOG_TARGET: &str = "tiny_postgres::observability";
