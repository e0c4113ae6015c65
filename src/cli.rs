//! CLI domain: parse, route, output and presentation for the `treesync` binary.
//! Commands inspect the saved session state and the effective configuration; they never
//! connect to a server.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, ConfigCommands, MapCommands, OutputFormat, StateCommands};
pub use presentation::{format_config, format_map, format_state};
pub use route::RunContext;
