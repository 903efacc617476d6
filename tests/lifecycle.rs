//! End-to-end lifecycle against a real PostgreSQL installation.
//!
//! Every test soft-skips when `initdb` and `postgres` are unavailable or the
//! environment forbids running them (for example as root).
#![cfg(unix)]

use color_eyre::eyre::{Result, ensure};
use postgres::NoTls;
use rstest::rstest;
use std::time::Duration;
use tiny_postgres::{InstanceConfig, InstanceState, Launcher};

#[path = "support/process.rs"]
mod process;
#[path = "support/real_pg.rs"]
mod real_pg;

use process::process_exists;
use real_pg::start_or_skip;

#[rstest]
fn started_instance_answers_queries_and_cleans_up() -> Result<()> {
    let launcher = Launcher::new();
    let Some(mut instance) = start_or_skip(&launcher, &InstanceConfig::default())? else {
        return Ok(());
    };
    let data_dir = instance.data_dir().to_owned();
    let pid = instance.pid();
    let port = instance.port();

    ensure!(instance.state() == InstanceState::Ready);
    let status = instance.status();
    ensure!(status.running && status.pid == Some(pid));

    let mut client = instance.connection().to_client_config().connect(NoTls)?;
    client.batch_execute("CREATE TABLE fixtures (id int PRIMARY KEY); INSERT INTO fixtures VALUES (1);")?;
    let row = client.query_one("SELECT count(*) FROM fixtures", &[])?;
    let count: i64 = row.try_get(0)?;
    ensure!(count == 1, "expected one fixture row, found {count}");
    drop(client);

    instance.stop()?;

    ensure!(!data_dir.exists(), "data directory should be removed");
    ensure!(!process_exists(pid), "server process should be gone");
    ensure!(!launcher.registry().is_reserved(port), "port should be released");
    Ok(())
}

#[rstest]
fn connection_url_works_with_the_client() -> Result<()> {
    let Some(instance) = start_or_skip(&Launcher::new(), &InstanceConfig::default())? else {
        return Ok(());
    };

    let mut client = postgres::Client::connect(&instance.url(), NoTls)?;
    let row = client.query_one("SELECT current_database()", &[])?;
    let database: String = row.try_get(0)?;

    ensure!(database == instance.connection().database());
    Ok(())
}

#[rstest]
fn unwinding_panic_tears_the_instance_down() -> Result<()> {
    let launcher = Launcher::new();
    let Some(instance) = start_or_skip(&launcher, &InstanceConfig::default())? else {
        return Ok(());
    };
    let data_dir = instance.data_dir().to_owned();
    let pid = instance.pid();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _guard = instance;
        panic!("test body failed while the instance was live");
    }));

    ensure!(outcome.is_err());
    ensure!(!data_dir.exists(), "data directory should be removed");
    ensure!(!process_exists(pid), "server process should be gone");
    ensure!(launcher.registry().is_empty());
    Ok(())
}

#[rstest]
fn kept_data_directory_can_be_restarted() -> Result<()> {
    let sandbox = tempfile::tempdir()?;
    let data_dir = camino::Utf8PathBuf::from_path_buf(sandbox.path().join("data"))
        .map_err(|path| color_eyre::eyre::eyre!("non UTF-8 path {}", path.display()))?;
    let config = InstanceConfig::default()
        .with_data_dir(data_dir.clone())
        .with_keep_data(true)
        .with_shutdown_timeout(Duration::from_secs(10));
    let launcher = Launcher::new();

    let Some(first) = start_or_skip(&launcher, &config)? else {
        return Ok(());
    };
    let mut client = first.connection().to_client_config().connect(NoTls)?;
    client.batch_execute("CREATE TABLE survivors (id int)")?;
    drop(client);
    first.stop()?;
    ensure!(data_dir.join("PG_VERSION").is_file(), "data should be kept");

    let Some(second) = start_or_skip(&launcher, &config)? else {
        return Ok(());
    };
    let mut client = second.connection().to_client_config().connect(NoTls)?;
    let row = client.query_one("SELECT to_regclass('survivors') IS NOT NULL", &[])?;
    let exists: bool = row.try_get(0)?;
    ensure!(exists, "table created by the first run should survive");
    drop(client);
    second.kill()?;
    Ok(())
}
