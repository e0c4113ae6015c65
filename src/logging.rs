//! Logging
//!
//! Structured logging through `tracing`. The filter comes from `TREESYNC_LOG` when set,
//! otherwise from the configured level plus per-module directives; `TREESYNC_LOG_MODULES`
//! adds directives on top. `TREESYNC_LOG_FORMAT` and `TREESYNC_LOG_OUTPUT` override the
//! configured format and destination.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error or off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json or text
    #[serde(default = "default_format")]
    pub format: String,

    /// stdout, stderr or file
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Colored text output on terminals
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-module levels, e.g. `treesync::propagate = "trace"`
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from(".treesync/treesync.log")
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: default_log_file(),
            color: default_true(),
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(SyncError::ConfigError(format!(
                "Invalid log format: {other} (must be 'json' or 'text')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

impl FromStr for LogOutput {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogOutput::Stdout),
            "stderr" => Ok(LogOutput::Stderr),
            "file" => Ok(LogOutput::File),
            other => Err(SyncError::ConfigError(format!(
                "Invalid log output: {other} (must be 'stdout', 'stderr' or 'file')"
            ))),
        }
    }
}

/// Install the global subscriber.
///
/// Priority: `TREESYNC_LOG*` environment variables, then `config`, then defaults. Installing
/// twice is an error.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), SyncError> {
    let defaults = LoggingConfig::default();
    let config = config.unwrap_or(&defaults);

    let filter = build_env_filter(config)?;
    let format = env_or("TREESYNC_LOG_FORMAT", &config.format).parse::<LogFormat>()?;
    let output = env_or("TREESYNC_LOG_OUTPUT", &config.output).parse::<LogOutput>()?;

    let (writer, ansi) = match output {
        LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), config.color),
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), config.color),
        LogOutput::File => (BoxMakeWriter::new(Arc::new(open_log_file(&config.file)?)), false),
    };

    let registry = Registry::default().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init(),
    };
    installed.map_err(|e| SyncError::ConfigError(format!("Failed to install logger: {e}")))
}

fn env_or(variable: &str, configured: &str) -> String {
    std::env::var(variable).unwrap_or_else(|_| configured.to_string())
}

fn open_log_file(path: &Path) -> Result<std::fs::File, SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SyncError::ConfigError(format!("Failed to create log directory: {e}"))
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SyncError::ConfigError(format!("Failed to open log file {path:?}: {e}")))
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, SyncError> {
    if let Ok(filter) = EnvFilter::try_from_env("TREESYNC_LOG") {
        return Ok(filter);
    }
    if config.level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut directives: Vec<String> = config
        .modules
        .iter()
        .map(|(module, level)| format!("{module}={level}"))
        .collect();
    if let Ok(modules) = std::env::var("TREESYNC_LOG_MODULES") {
        directives.extend(parse_module_directives(&modules));
    }

    let mut filter = EnvFilter::new(&config.level);
    for directive in directives {
        filter = filter.add_directive(
            directive.parse().map_err(|e| {
                SyncError::ConfigError(format!("Invalid log directive '{directive}': {e}"))
            })?,
        );
    }
    Ok(filter)
}

/// `a=debug, b = trace` into directives; malformed entries are skipped.
fn parse_module_directives(spec: &str) -> Vec<String> {
    spec.split(',')
        .filter_map(|entry| {
            let (module, level) = entry.split_once('=')?;
            let (module, level) = (module.trim(), level.trim());
            (!module.is_empty() && !level.is_empty()).then(|| format!("{module}={level}"))
        })
        .collect()
}
