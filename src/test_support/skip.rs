//! Soft-skip heuristics for tests that need a real PostgreSQL installation.
//!
//! Containers often run tests as root, where `initdb` refuses to work, and
//! CI images may not ship PostgreSQL at all. Those failures turn into skips
//! rather than assertion failures.

use crate::error::{LaunchErrorKind, TinyPgError};

/// Prefix used by messages that tests print when they skip.
pub const SKIP_TINY_POSTGRES_PREFIX: &str = "SKIP-TINY-POSTGRES";

const ENVIRONMENT_CONDITIONS: &[(&str, &str)] = &[
    ("cannot be run as root", "initdb refuses to run as root"),
    (
        "execution of the PostgreSQL server is not permitted",
        "postgres refuses to run as root",
    ),
    (
        "could not create shared memory segment",
        "the sandbox does not provide shared memory",
    ),
];

/// Returns a skip message when `err` stems from the environment rather than
/// from the code under test.
#[must_use]
pub fn skip_reason(err: &TinyPgError) -> Option<String> {
    let TinyPgError::Launch(launch) = err else {
        return None;
    };
    if launch.kind() == LaunchErrorKind::BinaryMissing {
        return Some(format_skip_reason(format!(
            "PostgreSQL binaries are unavailable: {launch}"
        )));
    }
    let haystack = format!("{launch}\n{}", launch.output()).to_ascii_lowercase();
    ENVIRONMENT_CONDITIONS
        .iter()
        .find(|(needle, _)| haystack.contains(&needle.to_ascii_lowercase()))
        .map(|(_, reason)| format_skip_reason(reason))
}

/// Prefixes `reason` with the shared skip marker.
#[must_use]
pub fn format_skip_reason(reason: impl AsRef<str>) -> String {
    format!("{SKIP_TINY_POSTGRES_PREFIX}: {}", reason.as_ref())
}
