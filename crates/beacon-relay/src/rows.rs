//! Row shapes of the two relay tables, field-exact against the hosted
//! schema so datastore-backed implementations can deserialize change
//! notifications directly into them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_shared::{CallId, CallStatus, ConversationId, SignalKind, UserId};

/// A `calls` row: one call attempt/session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRow {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    /// Set by the callee when the call goes `active`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on `declined` / `ended`.
    pub ended_at: Option<DateTime<Utc>>,
}

/// A `call_signals` row: one unit of negotiation data, append-only.
///
/// For a given call exactly one `offer` and at most one `answer` are
/// written; any number of `ice-candidate` rows may follow from either
/// side, in any order relative to the answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRow {
    pub id: Uuid,
    pub call_id: CallId,
    pub sender_id: UserId,
    pub signal_type: SignalKind,
    /// Opaque session-description or candidate payload; decoded by the
    /// consuming peer via `beacon_shared::signal`.
    pub signal_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
