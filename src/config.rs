//! Instance configuration and its environment overrides.
//!
//! [`InstanceConfig`] describes one instance. Defaults suit a test run on
//! the local machine: an allocated port on the loopback interface, a fresh
//! temporary data directory removed at teardown, and the current OS user as
//! superuser. [`TinyPgEnvCfg`] layers `TINYPG_*` environment variables on
//! top.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::readiness::RetryPolicy;

/// Default host the server listens on.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default database name handed to callers.
pub const DEFAULT_DATABASE: &str = "postgres";
/// Default budget for the server to start accepting connections.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
/// Default grace period between the shutdown signal and a kill.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
/// Default budget for `initdb`.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of ports tried when the server reports its address in use.
pub const DEFAULT_PORT_ATTEMPTS: u32 = 3;

const MAX_TIMEOUT_SECS: u64 = 600;
const FALLBACK_USER: &str = "postgres";

/// Settings for one instance.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use tiny_postgres::InstanceConfig;
///
/// let config = InstanceConfig::default()
///     .with_start_timeout(Duration::from_secs(10))
///     .with_server_option("fsync", "off");
/// assert!(config.port.is_none());
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Fixed port; a free one is allocated when `None`.
    pub port: Option<u16>,
    /// Address the server listens on.
    pub host: String,
    /// Superuser created by `initdb`.
    pub user: String,
    /// Database name exposed through the connection parameters.
    pub database: String,
    /// Data directory; a unique temporary one is created when `None`.
    pub data_dir: Option<Utf8PathBuf>,
    /// Leaves the data directory on disk after teardown.
    pub keep_data: bool,
    /// Directory holding `initdb` and `postgres`; discovered when `None`.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Budget for the server to accept connections.
    pub start_timeout: Duration,
    /// Grace period between the shutdown signal and a forced kill.
    pub shutdown_timeout: Duration,
    /// Budget for `initdb`.
    pub init_timeout: Duration,
    /// How many ports are tried when the server finds its address in use.
    pub port_attempts: u32,
    /// Backoff between readiness probes.
    pub retry_policy: RetryPolicy,
    /// Extra `-c key=value` settings passed to the server.
    pub server_options: Vec<(String, String)>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: DEFAULT_HOST.to_owned(),
            user: current_user(),
            database: DEFAULT_DATABASE.to_owned(),
            data_dir: None,
            keep_data: false,
            bin_dir: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
            server_options: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// Builds the defaults overlaid with `TINYPG_*` environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable cannot be parsed or is out of
    /// range.
    pub fn from_env() -> ConfigResult<Self> {
        TinyPgEnvCfg::load()?.apply(Self::default())
    }

    /// Requests a fixed port instead of an allocated one.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the listen address.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the superuser name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the database name exposed to callers.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Uses `dir` as the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Keeps or removes the data directory after teardown.
    #[must_use]
    pub const fn with_keep_data(mut self, keep: bool) -> Self {
        self.keep_data = keep;
        self
    }

    /// Resolves `initdb` and `postgres` from `dir`.
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    /// Sets the readiness budget.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the `initdb` budget.
    #[must_use]
    pub const fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Sets how many ports are tried on address-in-use failures.
    #[must_use]
    pub const fn with_port_attempts(mut self, attempts: u32) -> Self {
        self.port_attempts = attempts;
        self
    }

    /// Replaces the readiness backoff.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Appends a `-c key=value` server setting.
    #[must_use]
    pub fn with_server_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_options.push((key.into(), value.into()));
        self
    }

    /// Checks the settings for values the server would reject.
    ///
    /// # Errors
    /// Returns [`ConfigError`] describing the first invalid setting.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port == Some(0) {
            return Err(config_error("port must be between 1 and 65535"));
        }
        for (name, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
        ] {
            if value.trim().is_empty() {
                return Err(config_error(format!("{name} must not be empty")));
            }
        }
        if self.port_attempts == 0 {
            return Err(config_error("port_attempts must be at least 1"));
        }
        if let Some(dir) = &self.data_dir {
            validate_dir("data_dir", dir)?;
        }
        if let Some(dir) = &self.bin_dir {
            validate_dir("bin_dir", dir)?;
        }
        for (key, _) in &self.server_options {
            if key.is_empty() || key.contains(['=', ' ']) {
                return Err(config_error(format!("invalid server option name '{key}'")));
            }
        }
        Ok(())
    }
}

fn validate_dir(name: &str, dir: &Utf8Path) -> ConfigResult<()> {
    if dir.as_str().trim().is_empty() {
        return Err(config_error(format!("{name} must not be empty")));
    }
    Ok(())
}

fn config_error(message: impl std::fmt::Display) -> ConfigError {
    ConfigError::from(eyre!(message.to_string()))
}

/// Resolves the name of the effective OS user, which `initdb` would pick as
/// the default superuser.
fn current_user() -> String {
    #[cfg(unix)]
    {
        if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::geteuid()) {
            return user.name;
        }
    }
    std::env::var("USER")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_USER.to_owned())
}

/// Captures instance settings supplied via `TINYPG_*` environment variables.
///
/// # Examples
/// ```
/// use tiny_postgres::TinyPgEnvCfg;
///
/// let cfg = TinyPgEnvCfg::default();
/// assert!(cfg.port.is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "TINYPG")]
pub struct TinyPgEnvCfg {
    /// Fixed port for the server.
    pub port: Option<u16>,
    /// Address the server listens on.
    pub host: Option<String>,
    /// Superuser created by `initdb`.
    pub user: Option<String>,
    /// Database name exposed to callers.
    pub database: Option<String>,
    /// Data directory used instead of a temporary one.
    pub data_dir: Option<Utf8PathBuf>,
    /// Directory containing `initdb` and `postgres`.
    pub bin_dir: Option<Utf8PathBuf>,
    /// Leaves the data directory on disk after teardown; accepts `true`,
    /// `false`, `1`, `0`, `yes`, `no`, `on` or `off`.
    pub keep_data: Option<String>,
    /// Readiness budget in seconds.
    pub start_timeout_secs: Option<u64>,
    /// Shutdown grace period in seconds.
    pub shutdown_timeout_secs: Option<u64>,
}

impl TinyPgEnvCfg {
    /// Loads configuration from environment variables without parsing CLI
    /// arguments.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable cannot be deserialised.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("tiny-postgres")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Overlays the values that are set onto `config`.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a timeout is outside 1..=600 seconds or
    /// the resulting configuration is invalid.
    pub fn apply(&self, mut config: InstanceConfig) -> ConfigResult<InstanceConfig> {
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(user) = &self.user {
            config.user.clone_from(user);
        }
        if let Some(database) = &self.database {
            config.database.clone_from(database);
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.bin_dir {
            config.bin_dir = Some(dir.clone());
        }
        if let Some(raw) = &self.keep_data {
            config.keep_data = parse_switch("TINYPG_KEEP_DATA", raw)?;
        }
        if let Some(secs) = self.start_timeout_secs {
            config.start_timeout = timeout_from_secs("TINYPG_START_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            config.shutdown_timeout = timeout_from_secs("TINYPG_SHUTDOWN_TIMEOUT_SECS", secs)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_switch(name: &str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!(
            "{name} must be true or false (received '{raw}')"
        ))),
    }
}

/// Converts a whole number of seconds into a timeout, enforcing 1..=600.
///
/// # Errors
/// Returns [`ConfigError`] when `secs` is outside the accepted range.
pub fn timeout_from_secs(name: &str, secs: u64) -> ConfigResult<Duration> {
    if secs == 0 {
        return Err(config_error(format!(
            "{name} must be at least 1 second (received {secs})"
        )));
    }
    if secs > MAX_TIMEOUT_SECS {
        return Err(config_error(format!(
            "{name} must be {MAX_TIMEOUT_SECS} seconds or less (received {secs})"
        )));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn defaults_are_valid() {
        let config = InstanceConfig::default();

        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert!(!config.user.is_empty());
        assert!(!config.keep_data);
        assert_eq!(config.port_attempts, DEFAULT_PORT_ATTEMPTS);
        config.validate().expect("defaults validate");
    }

    #[rstest]
    #[case::zero_port(InstanceConfig::default().with_port(0), "port must be between")]
    #[case::empty_host(InstanceConfig::default().with_host(" "), "host must not be empty")]
    #[case::empty_user(InstanceConfig::default().with_user(""), "user must not be empty")]
    #[case::no_attempts(InstanceConfig::default().with_port_attempts(0), "port_attempts")]
    #[case::bad_option(
        InstanceConfig::default().with_server_option("fsync=off", "x"),
        "invalid server option"
    )]
    fn invalid_settings_are_rejected(#[case] config: InstanceConfig, #[case] expected: &str) {
        let err = config.validate().expect_err("invalid config");

        assert!(err.to_string().contains(expected), "{err}");
    }

    #[rstest]
    #[case(1, Ok(1))]
    #[case(600, Ok(600))]
    #[case(0, Err("must be at least 1 second"))]
    #[case(601, Err("must be 600 seconds or less"))]
    fn timeouts_are_bounded(#[case] secs: u64, #[case] expected: Result<u64, &str>) {
        let outcome = timeout_from_secs("TINYPG_START_TIMEOUT_SECS", secs);

        match (outcome, expected) {
            (Ok(duration), Ok(want)) => assert_eq!(duration, Duration::from_secs(want)),
            (Err(err), Err(fragment)) => {
                assert!(err.to_string().contains(fragment), "{err}");
                assert!(err.to_string().contains("TINYPG_START_TIMEOUT_SECS"), "{err}");
            }
            (outcome, expected) => panic!("unexpected {outcome:?} for {expected:?}"),
        }
    }

    #[rstest]
    fn env_values_override_defaults() {
        let env = TinyPgEnvCfg {
            port: Some(55_432),
            user: Some("fixture".into()),
            data_dir: Some(Utf8PathBuf::from("/tmp/tiny-pg-data")),
            keep_data: Some("true".into()),
            start_timeout_secs: Some(5),
            ..TinyPgEnvCfg::default()
        };

        let config = env.apply(InstanceConfig::default()).expect("apply");

        assert_eq!(config.port, Some(55_432));
        assert_eq!(config.user, "fixture");
        assert_eq!(config.data_dir.as_deref(), Some(Utf8Path::new("/tmp/tiny-pg-data")));
        assert!(config.keep_data);
        assert_eq!(config.start_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[rstest]
    #[case("true", Some(true))]
    #[case("1", Some(true))]
    #[case(" ON ", Some(true))]
    #[case("false", Some(false))]
    #[case("0", Some(false))]
    #[case("no", Some(false))]
    #[case("maybe", None)]
    fn keep_data_switch_is_parsed(#[case] raw: &str, #[case] expected: Option<bool>) {
        let env = TinyPgEnvCfg {
            keep_data: Some(raw.to_owned()),
            ..TinyPgEnvCfg::default()
        };
        let start = InstanceConfig::default().with_keep_data(!expected.unwrap_or(false));

        let outcome = env.apply(start);

        match expected {
            Some(keep) => assert_eq!(outcome.expect("valid switch").keep_data, keep),
            None => {
                let err = outcome.expect_err("invalid switch");
                assert!(err.to_string().contains("TINYPG_KEEP_DATA"), "{err}");
            }
        }
    }
}
