//! Locates the `initdb` and `postgres` executables used to run instances.
//!
//! Resolution order:
//! 1. an explicit binary directory (`bin_dir` / `TINYPG_BIN_DIR`);
//! 2. the `PATH` environment variable;
//! 3. well-known installation prefixes, preferring the newest versioned
//!    Debian-style layout (`/usr/lib/postgresql/<major>/bin`).

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;

use crate::error::{LaunchError, LaunchErrorKind};

const INITDB: &str = "initdb";
const POSTGRES: &str = "postgres";

const VERSIONED_ROOTS: [&str; 2] = ["/usr/lib/postgresql", "/usr/pgsql"];
const FLAT_CANDIDATES: [&str; 4] = [
    "/usr/local/pgsql/bin",
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
];

/// Resolved pair of `PostgreSQL` executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgBinaries {
    initdb: Utf8PathBuf,
    postgres: Utf8PathBuf,
    lib_dir: Option<Utf8PathBuf>,
}

impl PgBinaries {
    /// Resolves the executables, honouring `bin_dir` when provided.
    ///
    /// # Errors
    /// Returns a [`LaunchError`] of kind
    /// [`BinaryMissing`](LaunchErrorKind::BinaryMissing) when either
    /// executable cannot be found or is not executable.
    pub fn discover(bin_dir: Option<&Utf8Path>) -> Result<Self, LaunchError> {
        if let Some(dir) = bin_dir {
            return Self::in_dir(dir);
        }
        if let Some(dir) = discover_from_path() {
            return Self::located(&dir);
        }
        if let Some(dir) = discover_from_known_prefixes() {
            return Self::located(&dir);
        }
        Err(LaunchError::new(
            LaunchErrorKind::BinaryMissing,
            eyre!(concat!(
                "PostgreSQL binaries not found. Install PostgreSQL and ensure initdb ",
                "and postgres are in PATH, or set TINYPG_BIN_DIR to their directory."
            )),
        ))
    }

    /// Uses the executables inside `dir`.
    ///
    /// A sibling `lib` directory, when present, is exposed to the child
    /// processes through the dynamic loader search path.
    ///
    /// # Errors
    /// Returns a [`LaunchError`] of kind
    /// [`BinaryMissing`](LaunchErrorKind::BinaryMissing) when either
    /// executable is missing or not executable.
    pub fn in_dir(dir: &Utf8Path) -> Result<Self, LaunchError> {
        let mut binaries = Self::located(dir)?;
        binaries.lib_dir = dir
            .parent()
            .map(|prefix| prefix.join("lib"))
            .filter(|lib| lib.is_dir());
        Ok(binaries)
    }

    /// Uses the executables inside a discovered directory, leaving the
    /// loader search path to the system.
    fn located(dir: &Utf8Path) -> Result<Self, LaunchError> {
        let initdb = dir.join(executable_name(INITDB));
        let postgres = dir.join(executable_name(POSTGRES));
        validate_executable(&initdb)?;
        validate_executable(&postgres)?;
        Ok(Self {
            initdb,
            postgres,
            lib_dir: None,
        })
    }

    /// Returns the `initdb` executable path.
    #[must_use]
    pub fn initdb(&self) -> &Utf8Path {
        &self.initdb
    }

    /// Returns the `postgres` executable path.
    #[must_use]
    pub fn postgres(&self) -> &Utf8Path {
        &self.postgres
    }

    /// Returns the library directory exported to child processes, if any.
    #[must_use]
    pub fn lib_dir(&self) -> Option<&Utf8Path> {
        self.lib_dir.as_deref()
    }

    pub(crate) fn initdb_command(&self) -> Command {
        self.command(&self.initdb)
    }

    pub(crate) fn postgres_command(&self) -> Command {
        self.command(&self.postgres)
    }

    fn command(&self, program: &Utf8Path) -> Command {
        let mut command = Command::new(program.as_std_path());
        if let Some(lib) = &self.lib_dir {
            for var in ["LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"] {
                command.env(var, prepend_search_path(lib.as_std_path(), env::var_os(var)));
            }
        }
        command
    }
}

fn prepend_search_path(dir: &Path, existing: Option<OsString>) -> OsString {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(existing) = existing {
        paths.extend(env::split_paths(&existing));
    }
    env::join_paths(paths).unwrap_or_else(|_| dir.as_os_str().to_owned())
}

fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_owned()
    }
}

fn discover_from_path() -> Option<Utf8PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .find(|dir| has_both_binaries(dir))
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
}

fn discover_from_known_prefixes() -> Option<Utf8PathBuf> {
    VERSIONED_ROOTS
        .iter()
        .find_map(|root| newest_versioned_bin_dir(Path::new(root)))
        .or_else(|| {
            FLAT_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|dir| has_both_binaries(dir))
        })
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
}

fn newest_versioned_bin_dir(root: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let major = major_version(&entry.file_name().to_string_lossy())?;
            let bin = entry.path().join("bin");
            has_both_binaries(&bin).then_some((major, bin))
        })
        .max_by_key(|(major, _)| *major)
        .map(|(_, bin)| bin)
}

fn major_version(name: &str) -> Option<u32> {
    name.split('.').next()?.parse().ok()
}

fn has_both_binaries(dir: &Path) -> bool {
    dir.join(executable_name(INITDB)).is_file() && dir.join(executable_name(POSTGRES)).is_file()
}

fn validate_executable(path: &Utf8Path) -> Result<(), LaunchError> {
    let metadata = std::fs::metadata(path).map_err(|err| {
        LaunchError::new(
            LaunchErrorKind::BinaryMissing,
            eyre!("failed to access PostgreSQL binary at {path}: {err}"),
        )
    })?;

    if !metadata.is_file() {
        return Err(LaunchError::new(
            LaunchErrorKind::BinaryMissing,
            eyre!("PostgreSQL binary must be a regular file: {path}"),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::new(
                LaunchErrorKind::BinaryMissing,
                eyre!("PostgreSQL binary must be executable: {path}"),
            ));
        }
    }

    Ok(())
}
