//! Validates translating `TINYPG_*` environment variables into instance
//! configuration.

use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Result, ensure, eyre};
use rstest::rstest;
use serial_test::serial;
use tiny_postgres::{DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_START_TIMEOUT, InstanceConfig, TinyPgEnvCfg};

const VARS: [&str; 9] = [
    "TINYPG_PORT",
    "TINYPG_HOST",
    "TINYPG_USER",
    "TINYPG_DATABASE",
    "TINYPG_DATA_DIR",
    "TINYPG_BIN_DIR",
    "TINYPG_KEEP_DATA",
    "TINYPG_START_TIMEOUT_SECS",
    "TINYPG_SHUTDOWN_TIMEOUT_SECS",
];

fn with_only<R>(vars: &[(&str, &str)], action: impl FnOnce() -> R) -> R {
    let overrides: Vec<(&str, Option<&str>)> = VARS
        .iter()
        .map(|name| {
            let value = vars
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| *value);
            (*name, value)
        })
        .collect();
    temp_env::with_vars(overrides, action)
}

#[rstest]
#[serial]
fn defaults_apply_without_variables() -> Result<()> {
    let config = with_only(&[], InstanceConfig::from_env)?;

    ensure!(config.port.is_none());
    ensure!(config.data_dir.is_none());
    ensure!(!config.keep_data);
    ensure!(config.start_timeout == DEFAULT_START_TIMEOUT);
    ensure!(config.shutdown_timeout == DEFAULT_SHUTDOWN_TIMEOUT);
    Ok(())
}

#[rstest]
#[serial]
fn variables_override_defaults() -> Result<()> {
    let config = with_only(
        &[
            ("TINYPG_PORT", "55432"),
            ("TINYPG_USER", "fixture"),
            ("TINYPG_DATABASE", "app_test"),
            ("TINYPG_DATA_DIR", "/tmp/tiny-postgres-env"),
            ("TINYPG_BIN_DIR", "/usr/lib/postgresql/16/bin"),
            ("TINYPG_KEEP_DATA", "true"),
            ("TINYPG_START_TIMEOUT_SECS", "7"),
            ("TINYPG_SHUTDOWN_TIMEOUT_SECS", "42"),
        ],
        InstanceConfig::from_env,
    )?;

    ensure!(config.port == Some(55_432));
    ensure!(config.user == "fixture");
    ensure!(config.database == "app_test");
    ensure!(config.data_dir == Some(Utf8PathBuf::from("/tmp/tiny-postgres-env")));
    ensure!(config.bin_dir == Some(Utf8PathBuf::from("/usr/lib/postgresql/16/bin")));
    ensure!(config.keep_data);
    ensure!(config.start_timeout == Duration::from_secs(7));
    ensure!(config.shutdown_timeout == Duration::from_secs(42));
    Ok(())
}

#[rstest]
#[serial]
fn unset_switch_is_absent_after_loading() -> Result<()> {
    let cfg = with_only(&[], TinyPgEnvCfg::load)?;

    ensure!(cfg.keep_data.is_none(), "unexpected {:?}", cfg.keep_data);
    Ok(())
}

#[rstest]
#[case::numeric_on("1", true)]
#[case::word_off("false", false)]
#[serial]
fn keep_data_switch_is_read_from_the_environment(
    #[case] raw: &str,
    #[case] expected: bool,
) -> Result<()> {
    let config = with_only(&[("TINYPG_KEEP_DATA", raw)], || {
        InstanceConfig::from_env().map(|config| config.keep_data)
    })?;

    ensure!(config == expected, "TINYPG_KEEP_DATA={raw} gave {config}");
    Ok(())
}

#[rstest]
#[case::zero("0", "must be at least 1 second")]
#[case::too_long("601", "must be 600 seconds or less")]
#[serial]
fn out_of_range_timeouts_are_rejected(#[case] raw: &str, #[case] expected: &str) -> Result<()> {
    let outcome = with_only(
        &[("TINYPG_SHUTDOWN_TIMEOUT_SECS", raw)],
        InstanceConfig::from_env,
    );

    let err = outcome
        .err()
        .ok_or_else(|| eyre!("{raw} should be rejected"))?;
    ensure!(err.to_string().contains(expected), "{err}");
    ensure!(err.to_string().contains("TINYPG_SHUTDOWN_TIMEOUT_SECS"), "{err}");
    Ok(())
}

#[rstest]
#[serial]
fn non_numeric_values_are_rejected() -> Result<()> {
    let outcome = with_only(&[("TINYPG_PORT", "not-a-port")], InstanceConfig::from_env);

    ensure!(outcome.is_err(), "a non-numeric port should fail to load");
    Ok(())
}
