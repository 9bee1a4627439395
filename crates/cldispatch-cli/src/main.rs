//! cldispatch CLI
//!
//! Lists OpenCL devices, compiles kernel sources to device binaries and
//! runs single kernels with arguments loaded from raw files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cldispatch::{DispatchConfig, Dispatcher, SessionRegistry};
use std::sync::Arc;
use tracing::error;

mod commands;

use commands::{CompileCommand, InfoCommand, RunCommand};

#[cfg(feature = "opencl-runtime")]
type Backend = cldispatch::OpenClBackend;
#[cfg(not(feature = "opencl-runtime"))]
type Backend = cldispatch::ReferenceBackend;

/// cldispatch - synchronous OpenCL kernel dispatch
#[derive(Parser)]
#[command(name = "cldispatch")]
#[command(about = "Enumerate OpenCL devices, compile kernels and run them")]
#[command(long_about = r#"
Run one OpenCL kernel synchronously: build the program, upload arguments,
launch over a global range, download results and wait for the queue.

Examples:
  # List platforms and devices
  cldispatch info

  # Compile a kernel source to a device binary
  cldispatch compile add.cl --out add.bin

  # Run `add` over 4 items; inputs are read-only, the output write-only
  cldispatch run --kernel add --range 4 --source add.cl \
      --arg ro:a.bin --arg ro:b.bin --arg wo:c.bin
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true, env = "CLDISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Machine-readable JSON output and JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List platforms and devices
    #[command(alias = "devices")]
    Info(InfoCommand),

    /// Compile kernel source to a device binary
    Compile(CompileCommand),

    /// Run one kernel
    Run(RunCommand),
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref(), cli.json);

    if let Err(e) = run(cli) {
        error!("Command failed: {}", e);

        let mut source = e.source();
        while let Some(err) = source {
            error!("  Caused by: {}", err);
            source = err.source();
        }
        if let Some(dispatch) = commands::dispatch_error(&e) {
            error!(
                code = dispatch.status_code(),
                caller_error = dispatch.is_caller_error(),
                "dispatch status"
            );
        }

        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_configuration(cli.config.as_deref())?;
    let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new(backend(&config))), config);

    match cli.command {
        Commands::Info(cmd) => cmd.execute(&dispatcher, cli.json),
        Commands::Compile(cmd) => cmd.execute(&dispatcher, cli.json),
        Commands::Run(cmd) => cmd.execute(&dispatcher, cli.json),
    }
}

/// Load the config file when given, else defaults; env overrides apply
/// either way.
fn load_configuration(path: Option<&std::path::Path>) -> Result<DispatchConfig> {
    match path {
        Some(path) => DispatchConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => DispatchConfig::from_env().context("Invalid CLDISPATCH_* environment override"),
    }
}

#[cfg(feature = "opencl-runtime")]
fn backend(config: &DispatchConfig) -> Backend {
    cldispatch::OpenClBackend::from_config(config)
}

#[cfg(not(feature = "opencl-runtime"))]
fn backend(_config: &DispatchConfig) -> Backend {
    tracing::warn!("built without `opencl-runtime`; using the host reference backend");
    cldispatch::ReferenceBackend::new()
}

/// Logs go to stderr so JSON results on stdout stay parseable.
fn setup_logging(level: Option<&str>, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.unwrap_or("warn")));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
    } else {
        subscriber.compact().init();
    }
}
