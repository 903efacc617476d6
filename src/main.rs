//! Starts a throwaway `PostgreSQL` server from the command line.
//!
//! `tiny_postgres start` launches an instance, prints its status and keeps it
//! running until enter is pressed or the process receives `SIGINT`, `SIGTERM`
//! or `SIGHUP`. Either way the server is stopped and, with `--rm`, its data
//! directory removed before the binary exits. Settings come from `TINYPG_*` environment
//! variables parsed by [`OrthoConfig`](https://github.com/leynos/ortho-config),
//! overridden by the command-line flags. The binary exits with status code
//! `0` on success and `1` on error.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use tiny_postgres::{
    ConfigResult, Instance, InstanceConfig, InstanceStatus, Launcher, timeout_from_secs,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tiny_postgres", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a server and keep it running until enter is pressed.
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Port to listen on; a free port is allocated when omitted.
    #[arg(long)]
    port: Option<u16>,
    /// Remove the data directory when the server stops.
    #[arg(long)]
    rm: bool,
    /// Directory containing `initdb` and `postgres`.
    #[arg(long, value_name = "DIR")]
    bin_dir: Option<Utf8PathBuf>,
    /// Data directory to use instead of a temporary one.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<Utf8PathBuf>,
    /// Seconds to wait for the server to accept connections.
    #[arg(long, value_name = "SECS")]
    start_timeout: Option<u64>,
    /// Print the status as JSON.
    #[arg(long)]
    json: bool,
}

impl StartArgs {
    fn apply(&self, mut config: InstanceConfig) -> ConfigResult<InstanceConfig> {
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(dir) = &self.bin_dir {
            config.bin_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(secs) = self.start_timeout {
            config.start_timeout = timeout_from_secs("--start-timeout", secs)?;
        }
        config.keep_data = !self.rm;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    match Cli::parse().command {
        Command::Start(args) => start(&args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// What ended the wait for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Enter,
    Signal,
}

fn start(args: &StartArgs) -> Result<()> {
    let config = args.apply(InstanceConfig::from_env()?)?;
    // Installed before the server exists so an early Ctrl-C still reaches
    // the teardown below.
    let requests = stop_requests()?;
    let mut instance = Launcher::new().start(&config)?;

    let mut stdout = io::stdout().lock();
    write_status(&mut stdout, &instance.status(), args.json)?;
    writeln!(stdout, "Press enter to stop the server")?;
    stdout.flush()?;
    drop(stdout);

    serve(instance, &requests);
    Ok(())
}

/// Feeds enter presses (or end of input) and termination signals into one
/// channel.
fn stop_requests() -> Result<Receiver<StopRequest>> {
    let (tx, rx) = mpsc::channel();
    let signals = tx.clone();
    ctrlc::set_handler(move || drop(signals.send(StopRequest::Signal)))
        .wrap_err("failed to install the signal handler")?;
    thread::spawn(move || {
        let mut line = String::new();
        if let Err(err) = io::stdin().lock().read_line(&mut line) {
            warn!(error = %err, "failed to read from stdin; stopping");
        }
        drop(tx.send(StopRequest::Enter));
    });
    Ok(rx)
}

/// Blocks until a stop is requested, then tears the instance down.
///
/// Teardown failures are logged, not returned.
fn serve(instance: Instance, requests: &Receiver<StopRequest>) -> StopRequest {
    let request = requests.recv().unwrap_or(StopRequest::Enter);
    info!(?request, port = instance.port(), "stopping server");
    if let Err(err) = instance.stop() {
        warn!(error = %err, "failed to tear down the server");
    }
    request
}

fn write_status(out: &mut impl Write, status: &InstanceStatus, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, status).wrap_err("failed to render status")?;
        writeln!(out)?;
        return Ok(());
    }
    let pid = status
        .pid
        .map_or_else(|| "-".to_owned(), |pid| pid.to_string());
    writeln!(out, "state:    {}", status.state)?;
    writeln!(out, "pid:      {pid}")?;
    writeln!(out, "port:     {}", status.port)?;
    writeln!(out, "data_dir: {}", status.data_dir)?;
    writeln!(out, "running:  {}", status.running)?;
    writeln!(out, "url:      {}", status.url)?;
    Ok(())
}
