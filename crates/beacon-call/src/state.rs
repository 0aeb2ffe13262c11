//! Client-local call state.
//!
//! Caller path: idle → calling → active → idle. Callee path:
//! idle → ringing → active → idle (or ringing → idle on decline).
//! There is no resting "ended" phase — every terminal condition, local
//! or remote, resets straight back to the cleared idle shape.

use serde::Serialize;

use beacon_relay::CallRow;
use beacon_shared::{CallId, ConversationId, UserId};

/// Phase of the local call lifecycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    #[default]
    Idle,
    /// Outgoing call, waiting for the callee to answer.
    Calling,
    /// Incoming call, waiting for the local user to answer or decline.
    Ringing,
    Active,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

/// The client-local view of the active call. Owned exclusively by the
/// state machine; never shared between clients.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CallSessionState {
    pub call_id: Option<CallId>,
    pub conversation_id: Option<ConversationId>,
    pub phase: CallPhase,
    pub is_muted: bool,
    pub caller_id: Option<UserId>,
}

impl CallSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.phase == CallPhase::Idle
    }

    /// Guard for `start_call`: only valid from idle.
    pub fn begin_calling(&mut self, conversation_id: ConversationId) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.phase = CallPhase::Calling;
        self.conversation_id = Some(conversation_id);
        true
    }

    /// Guard for surfacing an inbound call: only valid from idle.
    pub fn ring(&mut self, call: &CallRow) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.phase = CallPhase::Ringing;
        self.call_id = Some(call.id);
        self.conversation_id = Some(call.conversation_id);
        self.caller_id = Some(call.caller_id);
        true
    }

    /// Guard for `answer`: only valid while ringing for this call.
    pub fn can_answer(&self, call_id: CallId) -> bool {
        self.phase == CallPhase::Ringing && self.call_id == Some(call_id)
    }

    /// Guard for `decline`: same condition as answering.
    pub fn can_decline(&self, call_id: CallId) -> bool {
        self.can_answer(call_id)
    }

    /// Back to the cleared idle shape. Every terminal condition funnels
    /// through here.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
