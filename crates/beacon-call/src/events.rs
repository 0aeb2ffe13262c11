//! Event types driving the state machine, and the notifications it
//! emits toward the UI layer.
//!
//! Everything the machine reacts to, relay pushes and user actions
//! alike, is routed through [`CallEvent`] and a single dispatch entry
//! point, rather than ad hoc callbacks closing over mutable state.

use serde::Serialize;

use beacon_relay::{CallRow, SignalRow};
use beacon_shared::{
    CallId, CandidatePayload, ConversationId, SessionDescription, SignalKind, UserId,
};

use crate::error::CallError;

/// Actions initiated by the local user.
#[derive(Debug, Clone)]
pub enum UserAction {
    Start(ConversationId),
    Answer {
        call_id: CallId,
        conversation_id: ConversationId,
    },
    Decline(CallId),
    End,
    ToggleMute,
}

/// One unit of input to the state machine.
#[derive(Debug, Clone)]
pub enum CallEvent {
    OfferReceived {
        call_id: CallId,
        sender: UserId,
        description: SessionDescription,
    },
    AnswerReceived {
        call_id: CallId,
        sender: UserId,
        description: SessionDescription,
    },
    CandidateReceived {
        call_id: CallId,
        sender: UserId,
        candidate: CandidatePayload,
    },
    StatusChanged(CallRow),
    User(UserAction),
}

impl CallEvent {
    /// Decode a relay signal row into an event. Malformed payloads are
    /// fatal to the call they belong to.
    pub fn from_signal(row: SignalRow) -> Result<Self, CallError> {
        let event = match row.signal_type {
            SignalKind::Offer => Self::OfferReceived {
                call_id: row.call_id,
                sender: row.sender_id,
                description: SessionDescription::from_value(&row.signal_data)?,
            },
            SignalKind::Answer => Self::AnswerReceived {
                call_id: row.call_id,
                sender: row.sender_id,
                description: SessionDescription::from_value(&row.signal_data)?,
            },
            SignalKind::IceCandidate => Self::CandidateReceived {
                call_id: row.call_id,
                sender: row.sender_id,
                candidate: CandidatePayload::from_value(&row.signal_data)?,
            },
        };
        Ok(event)
    }

    /// The call a remote event belongs to; `None` for user actions.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::OfferReceived { call_id, .. }
            | Self::AnswerReceived { call_id, .. }
            | Self::CandidateReceived { call_id, .. } => Some(*call_id),
            Self::StatusChanged(row) => Some(row.id),
            Self::User(_) => None,
        }
    }

    /// The authoring peer of a remote signal, for self-filtering.
    pub fn sender(&self) -> Option<UserId> {
        match self {
            Self::OfferReceived { sender, .. }
            | Self::AnswerReceived { sender, .. }
            | Self::CandidateReceived { sender, .. } => Some(*sender),
            Self::StatusChanged(_) | Self::User(_) => None,
        }
    }
}

/// User-visible call notifications. Rendering is the UI layer's
/// business; these carry the resolved metadata it needs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum CallNotification {
    /// An inbound call for the current user; drives the accept/decline
    /// prompt.
    IncomingCall {
        call_id: CallId,
        conversation_id: ConversationId,
        display_name: String,
        is_group: bool,
    },
    /// An outgoing call left the gate; drives the active-call surface.
    OutgoingCall {
        conversation_id: ConversationId,
        display_name: String,
        is_group: bool,
    },
    /// Call setup failed; the UI returns to its pre-call state.
    CallFailed { reason: String },
    /// Microphone permission denied or no device present.
    MicrophoneRequired,
    /// The remote side declined.
    CallDeclined,
    /// The call ended (either side hung up).
    CallEnded,
}
