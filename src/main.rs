use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use claude_usage_pulse::app;
use claude_usage_pulse::cli::{Cli, Commands};
use claude_usage_pulse::config::{self, PulseConfig};
use claude_usage_pulse::process_guard::{self, AcquireState};
use claude_usage_pulse::util::setup_tracing;
use claude_usage_pulse::worker;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("claude-usage-pulse error: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };
    let result = runtime.block_on(run());
    // A pending stdin read cannot be cancelled; don't wait on it.
    runtime.shutdown_timeout(Duration::from_millis(500));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("claude-usage-pulse error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command_or_default() {
        Commands::Worker => {
            worker::serve_stdio().await?;
            Ok(0)
        }
        Commands::Status { json } => {
            let config = PulseConfig::load_or_init()?;
            app::print_status(&config, json).await?;
            Ok(0)
        }
        Commands::Doctor => {
            let config = PulseConfig::load_or_init()?;
            app::doctor(&config)
        }
        Commands::Run { no_stdin } => {
            let config = PulseConfig::load_or_init()?;
            let guard = match process_guard::acquire_single_instance()
                .context("failed to acquire single-instance lock")?
            {
                AcquireState::Acquired(guard) => guard,
                AcquireState::AlreadyRunning { pid: Some(pid) } => {
                    bail!("claude-usage-pulse is already running (PID {pid})")
                }
                AcquireState::AlreadyRunning { pid: None } => {
                    bail!("claude-usage-pulse is already running")
                }
            };
            let runtime = config::runtime_settings();
            app::run(config, runtime, !no_stdin).await?;
            drop(guard);
            Ok(0)
        }
    }
}
