//! Configuration module for the Bronze runtime.
//!
//! Layered figment-based loading plus validation of logging, session,
//! dispatch and plugin settings.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use schema::{
    BronzeConfig, CommandConfig, DispatchConfig, LogFormat, LogLevel, LogOutput, LogRotation,
    LoggingConfig, PluginConfig, SessionConfig, SpanEventConfig,
};
pub use validation::validate_config;
