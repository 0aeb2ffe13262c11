//! Call-related error types.

use thiserror::Error;

use beacon_media::MediaError;
use beacon_relay::RelayError;
use beacon_shared::{CallId, PayloadError};

#[derive(Debug, Error)]
pub enum CallError {
    /// A second call was attempted while one is in progress.
    #[error("A call is already in progress")]
    AlreadyInCall,

    /// The requested action is not valid in the current phase.
    #[error("Cannot {0} in the current call state")]
    InvalidState(&'static str),

    /// Answering a call whose offer signal is missing from the relay.
    #[error("No offer recorded for call {0}")]
    MissingOffer(CallId),

    /// Microphone or peer connection failure.
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Datastore write/read failure.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Malformed remote payload or failed description/candidate
    /// application. Fatal to the call.
    #[error("Negotiation error: {0}")]
    Negotiation(String),
}

impl From<PayloadError> for CallError {
    fn from(e: PayloadError) -> Self {
        Self::Negotiation(e.to_string())
    }
}
