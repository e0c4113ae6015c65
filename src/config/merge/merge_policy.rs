//! Defaults applied beneath every file and environment layer.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Builder seeded with the values a bare session needs.
///
/// Struct-level serde defaults cover the rest; these are the keys the loader reads back
/// before deserializing.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("scheduler.workers", 2_i64)?
        .set_default("scheduler.poll_interval_ms", 100_i64)?
        .set_default("scheduler.edit_channel_capacity", 1024_i64)?
        .set_default("logging.level", "info")
}
