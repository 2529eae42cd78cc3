mod cmd;
mod util;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use probe_hub::HubConfig;

use crate::util::logging::setup_logging;

#[derive(clap::Parser)]
#[clap(
    name = "probe-hub",
    about = "Shared debug probe dispatcher",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Path to the hub configuration file.
    ///
    /// Without this option the default search locations are used
    /// (`probe-hub.{toml,yaml,json}` in the working directory and
    /// `/etc/probe-hub/`).
    #[clap(long, short, global = true, env = "PROBE_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Location for probe-hub's own JSON debug log
    #[clap(long, global = true, help_heading = "LOG CONFIGURATION")]
    log_file: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Run the dispatcher and its HTTP API
    Serve(cmd::serve::Cmd),
    /// Show connection status for every configured probe
    Status(cmd::status::Cmd),
    /// Find configured probes by interface, VID/PID, serial or name
    Finder(cmd::finder::Cmd),
    /// List configured targets with compatibility and transport policy
    Targets(cmd::targets::Cmd),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // The server narrates by default; the one-shot tools stay quiet unless
    // RUST_LOG says otherwise.
    let default_level = match cli.subcommand {
        Subcommand::Serve(_) => LevelFilter::INFO,
        _ => LevelFilter::WARN,
    };
    let _logger_guard = setup_logging(cli.log_file.as_deref(), default_level)?;

    let config =
        HubConfig::load(cli.config.as_deref()).context("Failed to load the hub configuration.")?;

    match cli.subcommand {
        Subcommand::Serve(cmd) => {
            cmd.run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Subcommand::Status(cmd) => {
            cmd.run(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Subcommand::Finder(cmd) => {
            let matched = cmd.run(&config)?;
            Ok(if matched {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Subcommand::Targets(cmd) => {
            cmd.run(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
