//! Drives the `tiny_postgres` binary and stops it with a signal.
#![cfg(unix)]

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::{Result, ensure, eyre};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, geteuid};
use rstest::rstest;
use tiny_postgres::PgBinaries;
use tiny_postgres::test_support::format_skip_reason;
use wait_timeout::ChildExt;

#[path = "support/process.rs"]
mod process;

use process::process_exists;

const ENVIRONMENT_FAILURES: [&str; 2] = ["cannot be run as root", "shared memory"];

fn skip_before_launch() -> Option<String> {
    if geteuid().is_root() {
        return Some(format_skip_reason("initdb refuses to run as root"));
    }
    PgBinaries::discover(None)
        .err()
        .map(|err| format_skip_reason(format!("PostgreSQL binaries are unavailable: {err}")))
}

#[rstest]
#[case::interrupt(Signal::SIGINT)]
#[case::terminate(Signal::SIGTERM)]
fn signal_stops_server_and_removes_data(#[case] signal: Signal) -> Result<()> {
    if let Some(reason) = skip_before_launch() {
        eprintln!("{reason}");
        return Ok(());
    }
    let sandbox = tempfile::tempdir()?;
    let data_dir = Utf8PathBuf::from_path_buf(sandbox.path().join("data"))
        .map_err(|path| eyre!("non UTF-8 path {}", path.display()))?;

    let mut cli = Command::new(env!("CARGO_BIN_EXE_tiny_postgres"))
        .args(["start", "--rm", "--data-dir", data_dir.as_str()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = cli.stdout.take().ok_or_else(|| eyre!("stdout not captured"))?;

    let mut server_pid = None;
    let mut prompted = false;
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        if let Some(pid) = line.strip_prefix("pid:") {
            server_pid = pid.trim().parse::<u32>().ok();
        }
        if line.contains("Press enter") {
            prompted = true;
            break;
        }
    }
    if !prompted {
        let mut stderr = String::new();
        if let Some(mut pipe) = cli.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }
        drop(cli.wait());
        if ENVIRONMENT_FAILURES.iter().any(|needle| stderr.contains(needle)) {
            eprintln!("{}", format_skip_reason("the environment cannot run PostgreSQL"));
            return Ok(());
        }
        return Err(eyre!("CLI exited before the server was ready:\n{stderr}"));
    }
    let server_pid = server_pid.ok_or_else(|| eyre!("status did not include a pid"))?;
    ensure!(data_dir.join("PG_VERSION").is_file());

    kill(Pid::from_raw(i32::try_from(cli.id())?), signal)?;
    let status = cli
        .wait_timeout(Duration::from_secs(30))?
        .ok_or_else(|| eyre!("CLI did not exit after {signal}"))?;

    ensure!(status.success(), "CLI exited with {status}");
    ensure!(!data_dir.exists(), "data directory survived {signal}");
    ensure!(!process_exists(server_pid), "postgres {server_pid} survived {signal}");
    Ok(())
}
