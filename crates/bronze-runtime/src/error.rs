//! Runtime error types.

use bronze_adapter_process::PluginError;
use bronze_framework::RegistryError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A plugin could not be started or stopped.
    #[error("plugin '{id}': {source}")]
    Plugin {
        id: String,
        #[source]
        source: PluginError,
    },

    /// A capability could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No plugin with this id is configured.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// `start` was called on a running runtime, or the runtime was shut down.
    #[error("Runtime is {0}")]
    InvalidState(&'static str),
}

impl RuntimeError {
    pub fn plugin(id: impl Into<String>, source: PluginError) -> Self {
        Self::Plugin {
            id: id.into(),
            source,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
