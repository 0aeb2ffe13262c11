//! In-process implementation of [`SignalRelay`].
//!
//! Backs the two tables with plain vectors and fans row events out to
//! subscribers over bounded mpsc channels. Used by the test suite and by
//! local single-process deployments; a hosted deployment replaces this
//! with a datastore-backed implementation of the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use beacon_shared::{CallId, CallStatus, ConversationId, SignalKind, UserId};

use crate::error::{RelayError, Result};
use crate::relay::{SignalRelay, TimestampField};
use crate::rows::{CallRow, SignalRow};

/// Per-subscription buffer. Signaling traffic is a handful of rows per
/// call, so a small buffer only overflows if a subscriber stopped
/// draining entirely.
const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Default)]
struct Tables {
    calls: Vec<CallRow>,
    signals: Vec<SignalRow>,
    signal_subs: HashMap<CallId, Vec<mpsc::Sender<SignalRow>>>,
    status_subs: HashMap<CallId, Vec<mpsc::Sender<CallRow>>>,
    inbound_subs: Vec<mpsc::Sender<CallRow>>,
}

/// In-memory event-sourced datastore for `calls` and `call_signals`.
#[derive(Default)]
pub struct MemoryRelay {
    tables: Mutex<Tables>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| RelayError::Backend(format!("Lock poisoned: {e}")))
    }

    /// Current state of a `calls` row. Test/inspection helper.
    pub fn get_call(&self, call_id: CallId) -> Option<CallRow> {
        let tables = self.tables().ok()?;
        tables.calls.iter().find(|c| c.id == call_id).cloned()
    }

    /// All `calls` rows for a conversation, in insertion order.
    pub fn calls_for_conversation(&self, conversation_id: ConversationId) -> Vec<CallRow> {
        let Ok(tables) = self.tables() else {
            return Vec::new();
        };
        tables
            .calls
            .iter()
            .filter(|c| c.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// All signal rows for a call, in insertion order.
    pub fn signals_for_call(&self, call_id: CallId) -> Vec<SignalRow> {
        let Ok(tables) = self.tables() else {
            return Vec::new();
        };
        tables
            .signals
            .iter()
            .filter(|s| s.call_id == call_id)
            .cloned()
            .collect()
    }
}

/// Deliver `row` to every live sender in `subs`, pruning closed ones.
fn fan_out<T: Clone>(subs: &mut Vec<mpsc::Sender<T>>, row: &T) {
    subs.retain(|tx| match tx.try_send(row.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Relay subscriber buffer full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn create_call(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
    ) -> Result<CallRow> {
        let mut tables = self.tables()?;

        // One non-terminal call per conversation, enforced at insert.
        if tables
            .calls
            .iter()
            .any(|c| c.conversation_id == conversation_id && !c.status.is_terminal())
        {
            return Err(RelayError::CallInProgress(conversation_id));
        }

        let row = CallRow {
            id: CallId::new(),
            conversation_id,
            caller_id,
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        tables.calls.push(row.clone());
        debug!(call_id = %row.id.short(), conversation = %conversation_id.short(), "Call row inserted");

        fan_out(&mut tables.inbound_subs, &row);
        Ok(row)
    }

    async fn update_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
        stamp: Option<TimestampField>,
    ) -> Result<()> {
        let mut tables = self.tables()?;

        let row = tables
            .calls
            .iter_mut()
            .find(|c| c.id == call_id)
            .ok_or(RelayError::CallNotFound(call_id))?;

        // Terminal states are final.
        if row.status.is_terminal() {
            debug!(call_id = %call_id.short(), status = %status, "Ignoring update to terminal call");
            return Ok(());
        }

        row.status = status;
        match stamp {
            Some(TimestampField::StartedAt) => row.started_at = Some(Utc::now()),
            Some(TimestampField::EndedAt) => row.ended_at = Some(Utc::now()),
            None => {}
        }
        let updated = row.clone();
        debug!(call_id = %call_id.short(), status = %status, "Call row updated");

        if let Some(subs) = tables.status_subs.get_mut(&call_id) {
            fan_out(subs, &updated);
        }
        Ok(())
    }

    async fn send_signal(
        &self,
        call_id: CallId,
        sender_id: UserId,
        signal_type: SignalKind,
        signal_data: serde_json::Value,
    ) -> Result<()> {
        let mut tables = self.tables()?;

        if !tables.calls.iter().any(|c| c.id == call_id) {
            return Err(RelayError::CallNotFound(call_id));
        }

        let row = SignalRow {
            id: Uuid::new_v4(),
            call_id,
            sender_id,
            signal_type,
            signal_data,
            created_at: Utc::now(),
        };
        tables.signals.push(row.clone());
        debug!(
            call_id = %call_id.short(),
            sender = %sender_id.short(),
            kind = %signal_type,
            "Signal row appended"
        );

        if let Some(subs) = tables.signal_subs.get_mut(&call_id) {
            fan_out(subs, &row);
        }
        Ok(())
    }

    async fn fetch_signal(
        &self,
        call_id: CallId,
        signal_type: SignalKind,
        exclude_sender: Option<UserId>,
    ) -> Result<Option<SignalRow>> {
        let tables = self.tables()?;
        Ok(tables
            .signals
            .iter()
            .find(|s| {
                s.call_id == call_id
                    && s.signal_type == signal_type
                    && exclude_sender != Some(s.sender_id)
            })
            .cloned())
    }

    async fn fetch_signals(
        &self,
        call_id: CallId,
        signal_type: SignalKind,
        exclude_sender: Option<UserId>,
    ) -> Result<Vec<SignalRow>> {
        let tables = self.tables()?;
        Ok(tables
            .signals
            .iter()
            .filter(|s| {
                s.call_id == call_id
                    && s.signal_type == signal_type
                    && exclude_sender != Some(s.sender_id)
            })
            .cloned()
            .collect())
    }

    async fn subscribe_signals(&self, call_id: CallId) -> Result<mpsc::Receiver<SignalRow>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut tables = self.tables()?;
        tables.signal_subs.entry(call_id).or_default().push(tx);
        Ok(rx)
    }

    async fn subscribe_call_status(&self, call_id: CallId) -> Result<mpsc::Receiver<CallRow>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut tables = self.tables()?;
        tables.status_subs.entry(call_id).or_default().push(tx);
        Ok(rx)
    }

    async fn subscribe_inbound_calls(&self) -> Result<mpsc::Receiver<CallRow>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut tables = self.tables()?;
        tables.inbound_subs.push(tx);
        Ok(rx)
    }
}
