//! Treesync CLI Binary
//!
//! Command-line interface for inspecting treesync session state.

use anyhow::Context;
use clap::Parser;
use std::process;
use tracing::{error, info};
use treesync::cli::{map_error, Cli, RunContext};
use treesync::config::ConfigLoader;
use treesync::logging::{init_logging, LoggingConfig};
use treesync::SyncError;

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("treesync starting");

    match run(&cli) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            match e.downcast_ref::<SyncError>() {
                Some(sync_error) => eprintln!("{}", map_error(sync_error)),
                None => eprintln!("{:#}", e),
            }
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<String> {
    let context = RunContext::new(&cli.workspace, cli.state.clone()).with_context(|| {
        format!("Failed to load configuration for {}", cli.workspace.display())
    })?;
    Ok(context.execute(&cli.command)?)
}

/// Logging settings from the config file, raised by `-v`.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = ConfigLoader::load(&cli.workspace)
        .map(|c| c.logging)
        .unwrap_or_default();
    match cli.verbose {
        0 => {}
        1 => config.level = "debug".to_string(),
        _ => config.level = "trace".to_string(),
    }
    config
}
