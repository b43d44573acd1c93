//! Bronze Runtime - Orchestration layer for the Bronze bot host.
//!
//! This crate provides:
//! - Layered configuration (`bronze.toml`, `BRONZE_*` environment variables)
//! - Logging setup driven by that configuration
//! - [`BronzeRuntime`]: the host that owns the registry, the event pipeline,
//!   the dialog manager and the supervised plugin processes
//!
//! # Example
//!
//! ```rust,ignore
//! use bronze_runtime::BronzeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = BronzeRuntime::builder().build()?;
//!
//!     // Plugins declared under [plugins.*] are spawned here
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [session]
//! ttl_secs = 300
//!
//! [plugins.weather]
//! command = "python3"
//! args = ["weather.py"]
//! events = ["notice"]
//!
//! [[plugins.weather.commands]]
//! name = "weather"
//! triggers = ["/weather"]
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{
    BronzeConfig, CommandConfig, ConfigError, ConfigLoader, ConfigResult, PluginConfig,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::LoggingBuilder;
pub use runtime::{BronzeRuntime, RuntimeBuilder, RuntimeStats};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
///
/// Provides the commonly used logging macros and `Level`.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
