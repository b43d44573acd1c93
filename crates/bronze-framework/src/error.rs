//! Error types for the Bronze framework.

use bronze_core::StoreError;
use thiserror::Error;

/// Boxed error returned by user-supplied handlers and listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a pipeline stage.
///
/// Any stage error aborts the remaining chain for that one event; the event
/// is then treated as unhandled and its buffered output is discarded.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// A stage reported a failure.
    #[error("stage '{stage}' failed: {reason}")]
    Failed {
        /// Name of the failing stage.
        stage: String,
        /// Reason for failure.
        reason: String,
    },

    /// A stage or handler panicked; the panic was caught at the pipeline boundary.
    #[error("stage panicked: {0}")]
    Panicked(String),

    /// Session storage failed while a stage was reading or writing it.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl StageError {
    /// Creates a failure attributed to `stage`.
    pub fn failed(stage: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while registering or invoking capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A capability with this name already exists.
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// The trigger is already owned by another capability.
    #[error("trigger '{trigger}' is already owned by capability '{owner}'")]
    TriggerConflict {
        /// The conflicting trigger.
        trigger: String,
        /// Capability that registered it first.
        owner: String,
    },

    /// Capability names and triggers must not be empty.
    #[error("capability '{0}' has an empty name or trigger")]
    Empty(String),

    /// No capability with this name is registered.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
}

/// Errors raised by the session store and the dialog state machine.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The underlying key/value store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation needs a live session but none exists (never started or expired).
    #[error("no active session for {0}")]
    NotFound(String),
}

/// Result type for stage execution.
pub type StageResult = Result<(), StageError>;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
