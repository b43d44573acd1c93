//! Error types for the collaborator interfaces.
//!
//! Each external collaborator gets its own error enum so callers can tell a
//! slow cache from a dead gateway. Host-level errors (pipeline, registry,
//! plugin processes) are defined in the crates that own those components.

use thiserror::Error;

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by a [`KvStore`](crate::KvStore) backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("key/value backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Reply Errors
// =============================================================================

/// Errors raised while delivering outbound text.
#[derive(Debug, Clone, Error)]
pub enum ReplyError {
    /// The outbound channel is gone (gateway disconnected, sink dropped).
    #[error("reply sink is closed")]
    Closed,

    /// The gateway refused or failed to deliver the message.
    #[error("failed to deliver reply to {target}: {reason}")]
    Delivery {
        /// Rendered target the reply was meant for.
        target: String,
        /// Reason for failure.
        reason: String,
    },
}

// =============================================================================
// Resolve Errors
// =============================================================================

/// Errors raised by an [`EntityResolver`](crate::EntityResolver).
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The entity service does not know the referenced entity.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// The entity service failed.
    #[error("entity service error: {0}")]
    Backend(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for key/value operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for reply delivery.
pub type ReplyResult<T> = Result<T, ReplyError>;

/// Result type for entity resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;
