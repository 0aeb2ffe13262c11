use thiserror::Error;

use beacon_shared::ConversationId;

/// Errors produced by the relay layer.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Insert rejected because the conversation already has a
    /// non-terminal (`ringing`/`active`) call.
    #[error("Conversation {0} already has a call in progress")]
    CallInProgress(ConversationId),

    /// The referenced `calls` row does not exist.
    #[error("Call not found: {0}")]
    CallNotFound(beacon_shared::CallId),

    /// Underlying datastore write/read failed (network, permission).
    #[error("Datastore error: {0}")]
    Backend(String),

    /// The relay has been shut down; no further operations are possible.
    #[error("Relay closed")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
