//! Client-facing entry point for calling.
//!
//! The controller owns the [`CallSession`] state machine, listens for
//! inbound `calls` rows, resolves display metadata through the
//! [`Directory`], and hands the UI a notification stream plus a small
//! imperative surface (`start_call`, `answer`, `decline`, `end`,
//! `toggle_mute`).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_media::MediaBackend;
use beacon_relay::{CallRow, Directory, SignalRelay};
use beacon_shared::{CallStatus, ConversationId, UserId};

use crate::error::CallError;
use crate::events::CallNotification;
use crate::session::CallSession;
use crate::state::{CallPhase, CallSessionState};

const NOTIFICATION_BUFFER: usize = 16;

pub struct CallController {
    local_user: UserId,
    relay: Arc<dyn SignalRelay>,
    directory: Arc<dyn Directory>,
    session: Arc<CallSession>,
    notifications: mpsc::Sender<CallNotification>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    /// Build a controller and the notification stream the UI consumes.
    /// Call [`CallController::start`] to begin receiving inbound calls.
    pub fn new(
        local_user: UserId,
        relay: Arc<dyn SignalRelay>,
        directory: Arc<dyn Directory>,
        media: Arc<dyn MediaBackend>,
    ) -> (Arc<Self>, mpsc::Receiver<CallNotification>) {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let session = CallSession::new(local_user, Arc::clone(&relay), media, notify_tx.clone());
        let controller = Arc::new(Self {
            local_user,
            relay,
            directory,
            session,
            notifications: notify_tx,
            listener: Mutex::new(None),
        });
        (controller, notify_rx)
    }

    /// Begin listening for inbound calls. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let inbound = self.relay.subscribe_inbound_calls().await?;
        *listener = Some(self.spawn_inbound_listener(inbound));
        info!(user = %self.local_user.short(), "call controller started");
        Ok(())
    }

    /// Stop the inbound listener and hang up any call in progress.
    pub async fn stop(self: &Arc<Self>) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.session.end().await {
            warn!(error = %e, "hangup during shutdown failed");
        }
    }

    /// Start a call in a conversation. Emits an
    /// [`CallNotification::OutgoingCall`] with resolved display
    /// metadata once setup succeeds.
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), CallError> {
        self.session.start_call(conversation_id).await?;
        let (display_name, is_group) = self.outgoing_display(conversation_id).await;
        self.notify(CallNotification::OutgoingCall {
            conversation_id,
            display_name,
            is_group,
        });
        Ok(())
    }

    /// Answer the currently ringing call.
    pub async fn answer(self: &Arc<Self>) -> Result<(), CallError> {
        let state = self.session.state().await;
        match (state.call_id, state.conversation_id) {
            (Some(call_id), Some(conversation_id)) => {
                self.session.answer(call_id, conversation_id).await
            }
            _ => Err(CallError::InvalidState("answer")),
        }
    }

    /// Decline the currently ringing call.
    pub async fn decline(self: &Arc<Self>) -> Result<(), CallError> {
        let state = self.session.state().await;
        match state.call_id {
            Some(call_id) => self.session.decline(call_id).await,
            None => Err(CallError::InvalidState("decline")),
        }
    }

    /// Hang up. A no-op when idle.
    pub async fn end(self: &Arc<Self>) -> Result<(), CallError> {
        self.session.end().await
    }

    pub async fn toggle_mute(self: &Arc<Self>) -> Result<(), CallError> {
        self.session.toggle_mute().await
    }

    /// Snapshot of the local call state, for rendering.
    pub async fn call_state(&self) -> CallSessionState {
        self.session.state().await
    }

    /// Current phase of the call lifecycle.
    pub async fn call_status(&self) -> CallPhase {
        self.session.state().await.phase
    }

    /// Conversation of the call in progress, if any.
    pub async fn active_conversation_id(&self) -> Option<ConversationId> {
        let state = self.session.state().await;
        if state.is_idle() {
            None
        } else {
            state.conversation_id
        }
    }

    fn spawn_inbound_listener(self: &Arc<Self>, mut rx: mpsc::Receiver<CallRow>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                controller.handle_inbound(call).await;
            }
            debug!("inbound call stream closed");
        })
    }

    async fn handle_inbound(self: &Arc<Self>, call: CallRow) {
        // Our own outgoing call echoes back through this stream.
        if call.caller_id == self.local_user {
            return;
        }
        if call.status != CallStatus::Ringing {
            return;
        }
        match self
            .directory
            .is_participant(call.conversation_id, self.local_user)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(call = %call.id.short(), error = %e, "membership check failed; ignoring inbound call");
                return;
            }
        }
        if !self.session.ring(&call).await {
            debug!(call = %call.id.short(), "already in a call; leaving inbound call ringing");
            return;
        }
        let (display_name, is_group) = self.incoming_display(&call).await;
        info!(call = %call.id.short(), caller = %call.caller_id.short(), "incoming call");
        self.notify(CallNotification::IncomingCall {
            call_id: call.id,
            conversation_id: call.conversation_id,
            display_name,
            is_group,
        });
    }

    /// Display metadata for an inbound call: the group name, or the
    /// caller's username for a direct conversation.
    async fn incoming_display(&self, call: &CallRow) -> (String, bool) {
        let conversation = self
            .directory
            .get_conversation(call.conversation_id)
            .await
            .ok()
            .flatten();
        let is_group = conversation.as_ref().map(|c| c.is_group).unwrap_or(false);
        if is_group {
            let name = conversation
                .and_then(|c| c.name)
                .unwrap_or_else(|| "Group Call".to_string());
            return (name, true);
        }
        let name = match self.directory.get_profile(call.caller_id).await {
            Ok(Some(profile)) => profile.username,
            Ok(None) => "Unknown".to_string(),
            Err(e) => {
                debug!(error = %e, "caller profile lookup failed");
                "Unknown".to_string()
            }
        };
        (name, false)
    }

    /// Display metadata for an outgoing call: the group name, or the
    /// other participant's username for a direct conversation.
    async fn outgoing_display(&self, conversation_id: ConversationId) -> (String, bool) {
        let conversation = match self.directory.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return ("Unknown".to_string(), false),
            Err(e) => {
                debug!(error = %e, "conversation lookup failed");
                return ("Unknown".to_string(), false);
            }
        };
        if conversation.is_group {
            let name = conversation
                .name
                .unwrap_or_else(|| "Group Call".to_string());
            return (name, true);
        }
        let other = conversation
            .participants
            .iter()
            .find(|&&p| p != self.local_user)
            .copied();
        let name = match other {
            Some(user) => match self.directory.get_profile(user).await {
                Ok(Some(profile)) => profile.username,
                _ => "Unknown".to_string(),
            },
            None => "Unknown".to_string(),
        };
        (name, false)
    }

    fn notify(&self, notification: CallNotification) {
        if self.notifications.try_send(notification).is_err() {
            warn!("dropping call notification; channel full or closed");
        }
    }
}
