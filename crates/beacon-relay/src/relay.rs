//! The relay contract consumed by the call state machine.

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_shared::{CallId, CallStatus, ConversationId, SignalKind, UserId};

use crate::error::Result;
use crate::rows::{CallRow, SignalRow};

/// Which timestamp column to stamp alongside a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    StartedAt,
    EndedAt,
}

/// Typed access to the `calls` / `call_signals` tables.
///
/// Writes are last-write-wins; no optimistic concurrency. Subscriptions
/// deliver every matching row insert/update, including self-authored
/// ones — filtering out our own signals is the subscriber's job. The
/// relay guarantees nothing about ordering beyond eventual delivery of
/// each individual event, and duplicate delivery is possible.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Insert a `calls` row with status `ringing`. Fails if the insert
    /// is rejected (network, permission, conversation already in a call);
    /// the caller must treat this as a fatal call-start error.
    async fn create_call(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
    ) -> Result<CallRow>;

    /// Patch the status (and optionally one timestamp column) of a call.
    async fn update_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
        stamp: Option<TimestampField>,
    ) -> Result<()>;

    /// Append a `call_signals` row.
    async fn send_signal(
        &self,
        call_id: CallId,
        sender_id: UserId,
        signal_type: SignalKind,
        signal_data: serde_json::Value,
    ) -> Result<()>;

    /// Point query for the first signal of a kind, used to retrieve the
    /// offer when answering a call that started before we subscribed.
    async fn fetch_signal(
        &self,
        call_id: CallId,
        signal_type: SignalKind,
        exclude_sender: Option<UserId>,
    ) -> Result<Option<SignalRow>>;

    /// Backfill query for all signals of a kind, in insertion order.
    async fn fetch_signals(
        &self,
        call_id: CallId,
        signal_type: SignalKind,
        exclude_sender: Option<UserId>,
    ) -> Result<Vec<SignalRow>>;

    /// Push delivery of every newly inserted signal row for a call.
    async fn subscribe_signals(&self, call_id: CallId) -> Result<mpsc::Receiver<SignalRow>>;

    /// Push delivery of every update to a `calls` row.
    async fn subscribe_call_status(&self, call_id: CallId) -> Result<mpsc::Receiver<CallRow>>;

    /// System-wide notification of newly inserted `calls` rows. Used by
    /// the session controller, not the state machine.
    async fn subscribe_inbound_calls(&self) -> Result<mpsc::Receiver<CallRow>>;
}
