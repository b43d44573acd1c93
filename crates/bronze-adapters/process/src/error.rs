//! Error types for the process adapter.

use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessState;

/// Errors raised while talking to (or supervising) a plugin process.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// No response arrived for a request within its deadline.
    #[error("request '{name}' timed out after {after:?}")]
    Timeout {
        /// Event name of the request.
        name: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The plugin was stopped on request.
    #[error("plugin stopped")]
    Stopped,

    /// The plugin exited on its own.
    #[error("plugin crashed: {0}")]
    Crashed(String),

    /// The connection to the plugin is gone (output closed, read failure).
    #[error("plugin connection closed: {0}")]
    Closed(String),

    /// The plugin is not in a state that accepts messages.
    #[error("plugin is {0}")]
    NotRunning(ProcessState),

    /// A lifecycle transition that the state machine forbids.
    #[error("invalid plugin state transition: {from} -> {to}")]
    InvalidTransition {
        from: ProcessState,
        to: ProcessState,
    },

    /// The process could not be started.
    #[error("failed to spawn plugin: {0}")]
    Spawn(String),

    /// Writing to or reading from the plugin's pipes failed.
    #[error("plugin I/O error: {0}")]
    Io(String),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Codec(String),

    /// The plugin answered with `ok: false`.
    #[error("plugin rejected the request: {0}")]
    Rejected(String),
}

impl PluginError {
    /// Whether the error means the plugin will never answer again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Crashed(_) | Self::Closed(_) | Self::NotRunning(_)
        )
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
