//! # tidemark-core
//!
//! Configuration, error types and logging setup shared by the tidemark
//! crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BatchingConfig, DatabaseConfig, LockRetriesConfig, LogFormat, LoggingConfig,
    MigrationsConfig, TidemarkConfig, TimingStep, DEFAULT_CONFIG_PATH,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::init_tracing;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
