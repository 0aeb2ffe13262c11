//! # beacon-shared
//!
//! Domain types shared across the Beacon call stack: user / conversation /
//! call identifiers, call and signal enumerations, and the JSON payload
//! shapes carried inside `call_signals` rows.

pub mod signal;
pub mod types;

pub use signal::{CandidatePayload, PayloadError, SdpKind, SessionDescription};
pub use types::{CallId, CallStatus, ConversationId, SignalKind, UserId};
