//! Shell-script stand-ins for `initdb` and `postgres`.
//!
//! Launch failures are easiest to reproduce with binaries that misbehave on
//! demand. A [`FakeInstallation`] writes two executable scripts into a
//! temporary `bin` directory that can be handed to
//! [`PgBinaries::in_dir`](crate::PgBinaries::in_dir) or
//! [`InstanceConfig::bin_dir`](crate::InstanceConfig::bin_dir).

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::binaries::PgBinaries;
use crate::error::LaunchError;

/// `initdb` replacement that creates `PG_VERSION` in the `-D` directory.
pub const FAKE_INITDB_OK: &str = r#"#!/bin/sh
dir=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-D" ]; then
    shift
    dir="$1"
  fi
  shift
done
mkdir -p "$dir" && echo 16 > "$dir/PG_VERSION"
echo "Success. You can now start the database server"
"#;

/// `postgres` replacement that never accepts connections.
pub const FAKE_POSTGRES_HANG: &str = "#!/bin/sh\nexec sleep 60\n";

/// Temporary directory holding fake `initdb` and `postgres` executables.
#[derive(Debug)]
pub struct FakeInstallation {
    _root: TempDir,
    sandbox: Utf8PathBuf,
    bin_dir: Utf8PathBuf,
}

impl FakeInstallation {
    /// Writes the two scripts and marks them executable.
    ///
    /// # Errors
    /// Returns any I/O error raised while creating the files.
    pub fn new(initdb: &str, postgres: &str) -> io::Result<Self> {
        let root = tempfile::Builder::new().prefix("tiny-postgres-fake-").tempdir()?;
        let base = Utf8PathBuf::from_path_buf(root.path().to_path_buf())
            .map_err(|path| io::Error::other(format!("non UTF-8 path {}", path.display())))?;
        let bin_dir = base.join("bin");
        let sandbox = base.join("sandbox");
        fs::create_dir_all(&bin_dir)?;
        fs::create_dir_all(&sandbox)?;
        write_script(&bin_dir.join("initdb"), initdb)?;
        write_script(&bin_dir.join("postgres"), postgres)?;
        Ok(Self {
            _root: root,
            sandbox,
            bin_dir,
        })
    }

    /// Returns the directory containing the scripts.
    #[must_use]
    pub fn bin_dir(&self) -> &Utf8Path {
        &self.bin_dir
    }

    /// Returns a scratch directory removed together with the installation.
    #[must_use]
    pub fn sandbox(&self) -> &Utf8Path {
        &self.sandbox
    }

    /// Resolves the scripts as [`PgBinaries`].
    ///
    /// # Errors
    /// Propagates validation failures from [`PgBinaries::in_dir`].
    pub fn binaries(&self) -> Result<PgBinaries, LaunchError> {
        PgBinaries::in_dir(&self.bin_dir)
    }
}

fn write_script(path: &Utf8Path, body: &str) -> io::Result<()> {
    fs::write(path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
