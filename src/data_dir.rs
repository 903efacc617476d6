//! Per-instance data directories with guarded, exactly-once removal.

use std::io::ErrorKind;
use std::path::{Component, Path};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;

use crate::error::{LaunchError, LaunchErrorKind, TeardownError};
use crate::observability::LOG_TARGET;

const TEMP_PREFIX: &str = "tiny-postgres-";

/// Records the outcome of a guarded directory removal attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RemovalOutcome {
    Removed,
    Missing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposal {
    Remove,
    Keep,
}

/// Data directory owned by one instance.
///
/// The directory is removed at most once: either explicitly via
/// [`DataDir::remove`] during teardown or, as a fallback, when the guard
/// drops.
#[derive(Debug)]
pub(crate) struct DataDir {
    path: Utf8PathBuf,
    disposal: Disposal,
    removed: bool,
}

impl DataDir {
    /// Creates a uniquely named directory under the system temporary
    /// directory.
    pub(crate) fn temporary(keep: bool) -> Result<Self, LaunchError> {
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir()
            .map_err(|err| {
                LaunchError::new(
                    LaunchErrorKind::Io,
                    eyre!("failed to create temporary data directory: {err}"),
                )
            })?;
        let path = Utf8PathBuf::from_path_buf(dir.keep()).map_err(|path| {
            LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("temporary data directory is not valid UTF-8: {}", path.display()),
            )
        })?;
        Ok(Self::new(path, keep))
    }

    /// Adopts a caller-chosen directory, creating it when absent.
    pub(crate) fn at(path: &Utf8Path, keep: bool) -> Result<Self, LaunchError> {
        if has_parent_dir(path.as_std_path()) {
            return Err(LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("refuse to use data directory containing '..': {path}"),
            ));
        }
        std::fs::create_dir_all(path).map_err(|err| {
            LaunchError::new(
                LaunchErrorKind::Io,
                eyre!("failed to create data directory {path}: {err}"),
            )
        })?;
        Ok(Self::new(path.to_owned(), keep))
    }

    const fn new(path: Utf8PathBuf, keep: bool) -> Self {
        Self {
            path,
            disposal: if keep { Disposal::Keep } else { Disposal::Remove },
            removed: false,
        }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn is_disposable(&self) -> bool {
        self.disposal == Disposal::Remove
    }

    /// Leaves the directory on disk when the instance is torn down.
    pub(crate) fn keep(&mut self) {
        self.disposal = Disposal::Keep;
    }

    /// Removes the directory unless it is kept or already gone.
    pub(crate) fn remove(&mut self) -> Result<(), TeardownError> {
        if self.removed || self.disposal == Disposal::Keep {
            return Ok(());
        }
        self.removed = true;
        match try_remove_dir_all(self.path.as_std_path()) {
            Ok(RemovalOutcome::Removed) => {
                tracing::info!(target: LOG_TARGET, path = %self.path, "removed data directory");
                Ok(())
            }
            Ok(RemovalOutcome::Missing) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    path = %self.path,
                    "data directory already removed"
                );
                Ok(())
            }
            Err(err) => Err(TeardownError::from(eyre!(
                "failed to remove data directory {}: {err}",
                self.path
            ))),
        }
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            tracing::warn!(target: LOG_TARGET, error = %err, "data directory cleanup failed");
        }
    }
}

/// Checks whether a path contains any parent-directory (`..`) components.
pub(crate) fn has_parent_dir(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Attempts to remove a directory tree, rejecting unsafe paths before deletion.
pub(crate) fn try_remove_dir_all(path: &Path) -> Result<RemovalOutcome, std::io::Error> {
    guard_removal_path(path)?;
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(RemovalOutcome::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RemovalOutcome::Missing),
        Err(err) => Err(err),
    }
}

fn guard_removal_path(path: &Path) -> Result<(), std::io::Error> {
    if is_empty_or_root(path) || has_parent_dir(path) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("refuse to remove unsafe path {}", path.display()),
        ));
    }
    Ok(())
}

fn is_empty_or_root(path: &Path) -> bool {
    let mut components = path.components();
    match components.next() {
        None => true,
        Some(Component::CurDir | Component::RootDir) => components.next().is_none(),
        Some(Component::Prefix(_)) => match components.next() {
            None => true,
            Some(Component::RootDir) => components.next().is_none(),
            _ => false,
        },
        _ => false,
    }
}
