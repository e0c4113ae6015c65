//! CLI parse: clap types for treesync. No behavior; definitions only.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Treesync CLI - inspect a local/remote tree synchronization session
#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about = "Inspect the state of a local/remote model tree synchronization session")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// State database directory (overrides persistence.state_path)
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Saved session state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Saved identity map
    Map {
        #[command(subcommand)]
        command: MapCommands,
    },
    /// Effective configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the saved connection target, version and bound modules
    Show {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Delete the saved state
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum MapCommands {
    /// List every entry of the saved identity map
    Show {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the merged configuration as TOML
    Show,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
