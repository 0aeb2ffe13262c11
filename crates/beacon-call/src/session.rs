//! The call state machine.
//!
//! One [`CallSession`] exists per client. Every input, relay pushes and
//! local user actions alike, funnels through [`CallSession::dispatch`]
//! under a single lock, so phase checks and media operations never race
//! each other.
//!
//! Remote events are filtered twice before they reach the match arms:
//! events for a call other than the current one are discarded (late
//! signals from a torn-down call must not touch a new one), and events
//! authored by the local user are discarded (the relay echoes our own
//! writes back to us).

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beacon_media::MediaBackend;
use beacon_relay::{CallRow, SignalRelay, SignalRow, TimestampField};
use beacon_shared::{
    CallId, CallStatus, CandidatePayload, ConversationId, SessionDescription, SignalKind, UserId,
};

use crate::error::CallError;
use crate::events::{CallEvent, CallNotification, UserAction};
use crate::state::{CallPhase, CallSessionState};

/// Everything that must change together under one lock.
struct SessionInner {
    state: CallSessionState,
    media_session: Option<Box<dyn beacon_media::MediaSession>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-client call state machine. Construct one and share it via `Arc`.
pub struct CallSession {
    local_user: UserId,
    relay: Arc<dyn SignalRelay>,
    media: Arc<dyn MediaBackend>,
    notifications: mpsc::Sender<CallNotification>,
    inner: Mutex<SessionInner>,
}

impl CallSession {
    pub fn new(
        local_user: UserId,
        relay: Arc<dyn SignalRelay>,
        media: Arc<dyn MediaBackend>,
        notifications: mpsc::Sender<CallNotification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            relay,
            media,
            notifications,
            inner: Mutex::new(SessionInner {
                state: CallSessionState::new(),
                media_session: None,
                tasks: Vec::new(),
            }),
        })
    }

    /// Snapshot of the local call state.
    pub async fn state(&self) -> CallSessionState {
        self.inner.lock().await.state.clone()
    }

    /// Surface an inbound ringing call. Returns `false` (and changes
    /// nothing) if the client is already in a call.
    pub async fn ring(&self, call: &CallRow) -> bool {
        let mut inner = self.inner.lock().await;
        inner.state.ring(call)
    }

    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), CallError> {
        self.dispatch(CallEvent::User(UserAction::Start(conversation_id)))
            .await
    }

    pub async fn answer(
        self: &Arc<Self>,
        call_id: CallId,
        conversation_id: ConversationId,
    ) -> Result<(), CallError> {
        self.dispatch(CallEvent::User(UserAction::Answer {
            call_id,
            conversation_id,
        }))
        .await
    }

    pub async fn decline(self: &Arc<Self>, call_id: CallId) -> Result<(), CallError> {
        self.dispatch(CallEvent::User(UserAction::Decline(call_id)))
            .await
    }

    pub async fn end(self: &Arc<Self>) -> Result<(), CallError> {
        self.dispatch(CallEvent::User(UserAction::End)).await
    }

    pub async fn toggle_mute(self: &Arc<Self>) -> Result<(), CallError> {
        self.dispatch(CallEvent::User(UserAction::ToggleMute)).await
    }

    /// Single entry point for every input to the machine.
    pub async fn dispatch(self: &Arc<Self>, event: CallEvent) -> Result<(), CallError> {
        match event {
            CallEvent::User(action) => self.handle_user(action).await,
            remote => self.handle_remote(remote).await,
        }
    }

    async fn handle_user(self: &Arc<Self>, action: UserAction) -> Result<(), CallError> {
        match action {
            UserAction::Start(conversation_id) => {
                let mut inner = self.inner.lock().await;
                if !inner.state.begin_calling(conversation_id) {
                    return Err(CallError::AlreadyInCall);
                }
                info!(conversation = %conversation_id.short(), "starting call");
                if let Err(e) = self.setup_outgoing(&mut inner, conversation_id).await {
                    self.abort_call_locked(&mut inner).await;
                    self.notify_setup_failure(&e);
                    return Err(e);
                }
                Ok(())
            }
            UserAction::Answer {
                call_id,
                conversation_id,
            } => {
                let mut inner = self.inner.lock().await;
                if !inner.state.can_answer(call_id) {
                    return Err(CallError::InvalidState("answer"));
                }
                // Optimistic: flip to active before the relay write so
                // the UI reacts immediately. Setup failure rolls back
                // through abort_call_locked.
                inner.state.phase = CallPhase::Active;
                inner.state.conversation_id = Some(conversation_id);
                info!(call = %call_id.short(), "answering call");
                if let Err(e) = self.setup_callee(&mut inner, call_id).await {
                    self.abort_call_locked(&mut inner).await;
                    self.notify_setup_failure(&e);
                    return Err(e);
                }
                Ok(())
            }
            UserAction::Decline(call_id) => {
                let mut inner = self.inner.lock().await;
                if !inner.state.can_decline(call_id) {
                    return Err(CallError::InvalidState("decline"));
                }
                self.relay
                    .update_call_status(call_id, CallStatus::Declined, None)
                    .await?;
                self.teardown_locked(&mut inner).await;
                info!(call = %call_id.short(), "declined call");
                Ok(())
            }
            UserAction::End => {
                let mut inner = self.inner.lock().await;
                if inner.state.is_idle() {
                    return Ok(());
                }
                if let Some(call_id) = inner.state.call_id {
                    if let Err(e) = self
                        .relay
                        .update_call_status(
                            call_id,
                            CallStatus::Ended,
                            Some(TimestampField::EndedAt),
                        )
                        .await
                    {
                        warn!(error = %e, "failed to mark call ended; tearing down anyway");
                    }
                }
                self.teardown_locked(&mut inner).await;
                Ok(())
            }
            UserAction::ToggleMute => {
                let mut inner = self.inner.lock().await;
                let muted = !inner.state.is_muted;
                let media = inner
                    .media_session
                    .as_deref()
                    .ok_or(CallError::InvalidState("toggle the microphone"))?;
                // Track-level flip only; no renegotiation, no signals.
                media.set_muted(muted);
                inner.state.is_muted = muted;
                Ok(())
            }
        }
    }

    async fn handle_remote(self: &Arc<Self>, event: CallEvent) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;

        let Some(event_call) = event.call_id() else {
            return Ok(());
        };
        if inner.state.call_id != Some(event_call) {
            debug!(call = %event_call.short(), "discarding signal for stale call");
            return Ok(());
        }
        if event.sender() == Some(self.local_user) {
            return Ok(());
        }

        match event {
            // Offers are fetched from the relay at answer time, never
            // applied from the push stream.
            CallEvent::OfferReceived { .. } => {}
            CallEvent::AnswerReceived {
                description, sender, ..
            } => {
                if inner.state.phase != CallPhase::Calling {
                    debug!(phase = %inner.state.phase, "ignoring answer outside the calling phase");
                    return Ok(());
                }
                let result = {
                    let media = inner
                        .media_session
                        .as_deref()
                        .ok_or(CallError::InvalidState("apply an answer"))?;
                    media.set_remote_description(description).await
                };
                if let Err(e) = result {
                    return self.fail_locked(&mut inner, e.to_string()).await;
                }
                inner.state.phase = CallPhase::Active;
                info!(peer = %sender.short(), "call connected");
            }
            CallEvent::CandidateReceived { candidate, .. } => {
                let result = {
                    let media = inner
                        .media_session
                        .as_deref()
                        .ok_or(CallError::InvalidState("apply a candidate"))?;
                    media.add_ice_candidate(candidate).await
                };
                if let Err(e) = result {
                    return self.fail_locked(&mut inner, e.to_string()).await;
                }
            }
            CallEvent::StatusChanged(row) => match row.status {
                CallStatus::Declined => {
                    info!(call = %row.id.short(), "call declined by remote");
                    self.teardown_locked(&mut inner).await;
                    self.notify(CallNotification::CallDeclined);
                }
                CallStatus::Ended => {
                    info!(call = %row.id.short(), "call ended by remote");
                    self.teardown_locked(&mut inner).await;
                    self.notify(CallNotification::CallEnded);
                }
                // The answer signal, not the row update, drives the
                // caller's active transition.
                CallStatus::Ringing | CallStatus::Active => {}
            },
            // Routed through handle_user by dispatch.
            CallEvent::User(_) => {}
        }
        Ok(())
    }

    /// Caller-side setup: microphone, relay row, subscriptions, offer.
    async fn setup_outgoing(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        conversation_id: ConversationId,
    ) -> Result<(), CallError> {
        let media = self.media.open().await?;
        inner.media_session = Some(media);

        let call = self
            .relay
            .create_call(conversation_id, self.local_user)
            .await?;
        inner.state.call_id = Some(call.id);

        // Subscribe before publishing the offer so the answer cannot
        // slip past us.
        let signals = self.relay.subscribe_signals(call.id).await?;
        let statuses = self.relay.subscribe_call_status(call.id).await?;
        self.spawn_call_tasks(inner, call.id, signals, statuses);

        let offer = {
            let media = inner
                .media_session
                .as_deref()
                .ok_or(CallError::InvalidState("create an offer"))?;
            media.create_offer().await?
        };
        self.relay
            .send_signal(call.id, self.local_user, SignalKind::Offer, offer.to_value()?)
            .await?;
        debug!(call = %call.id.short(), "offer published");
        Ok(())
    }

    /// Callee-side setup: microphone, offer retrieval, answer,
    /// candidate backfill.
    async fn setup_callee(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        call_id: CallId,
    ) -> Result<(), CallError> {
        let media = self.media.open().await?;
        inner.media_session = Some(media);

        // Subscribe before the backfill reads; anything delivered both
        // ways is deduplicated at the media layer.
        let signals = self.relay.subscribe_signals(call_id).await?;
        let statuses = self.relay.subscribe_call_status(call_id).await?;

        let offer_row = self
            .relay
            .fetch_signal(call_id, SignalKind::Offer, Some(self.local_user))
            .await?
            .ok_or(CallError::MissingOffer(call_id))?;
        let offer = SessionDescription::from_value(&offer_row.signal_data)?;

        {
            let media = inner
                .media_session
                .as_deref()
                .ok_or(CallError::InvalidState("apply the offer"))?;
            media.set_remote_description(offer).await?;
        }

        self.spawn_call_tasks(inner, call_id, signals, statuses);

        let answer = {
            let media = inner
                .media_session
                .as_deref()
                .ok_or(CallError::InvalidState("create an answer"))?;
            media.create_answer().await?
        };
        self.relay
            .send_signal(
                call_id,
                self.local_user,
                SignalKind::Answer,
                answer.to_value()?,
            )
            .await?;

        self.relay
            .update_call_status(call_id, CallStatus::Active, Some(TimestampField::StartedAt))
            .await?;

        // Candidates the caller published before we subscribed.
        let backlog = self
            .relay
            .fetch_signals(call_id, SignalKind::IceCandidate, Some(self.local_user))
            .await?;
        for row in backlog {
            let candidate = CandidatePayload::from_value(&row.signal_data)?;
            let media = inner
                .media_session
                .as_deref()
                .ok_or(CallError::InvalidState("apply a candidate"))?;
            media.add_ice_candidate(candidate).await?;
        }
        debug!(call = %call_id.short(), "answer published");
        Ok(())
    }

    /// Start the per-call background tasks: the local candidate
    /// forwarder and the two relay pumps.
    fn spawn_call_tasks(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        call_id: CallId,
        signals: mpsc::Receiver<SignalRow>,
        statuses: mpsc::Receiver<CallRow>,
    ) {
        let candidates = inner
            .media_session
            .as_deref()
            .and_then(|m| m.take_local_candidates());
        if let Some(rx) = candidates {
            inner.tasks.push(self.spawn_candidate_forwarder(call_id, rx));
        }
        inner.tasks.push(self.spawn_signal_pump(signals));
        inner.tasks.push(self.spawn_status_pump(statuses));
    }

    fn spawn_candidate_forwarder(
        self: &Arc<Self>,
        call_id: CallId,
        mut rx: mpsc::Receiver<CandidatePayload>,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(&self.relay);
        let local_user = self.local_user;
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                let payload = match candidate.to_value() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "skipping unserializable local candidate");
                        continue;
                    }
                };
                if let Err(e) = relay
                    .send_signal(call_id, local_user, SignalKind::IceCandidate, payload)
                    .await
                {
                    warn!(call = %call_id.short(), error = %e, "failed to publish local candidate");
                }
            }
        })
    }

    fn spawn_signal_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<SignalRow>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                let call_id = row.call_id;
                let event = match CallEvent::from_signal(row) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(call = %call_id.short(), error = %e, "dropping call on malformed signal");
                        session.fail_call(call_id, e.to_string()).await;
                        break;
                    }
                };
                if let Err(e) = session.dispatch(event).await {
                    debug!(call = %call_id.short(), error = %e, "signal handling failed");
                }
            }
        })
    }

    fn spawn_status_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<CallRow>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                if let Err(e) = session.dispatch(CallEvent::StatusChanged(row)).await {
                    debug!(error = %e, "status handling failed");
                }
            }
        })
    }

    /// Fatal mid-call failure from a background task.
    async fn fail_call(self: &Arc<Self>, call_id: CallId, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.state.call_id != Some(call_id) {
            return;
        }
        self.abort_call_locked(&mut inner).await;
        self.notify(CallNotification::CallFailed { reason });
    }

    /// Fatal mid-call failure from the dispatch path.
    async fn fail_locked(
        &self,
        inner: &mut SessionInner,
        reason: String,
    ) -> Result<(), CallError> {
        self.abort_call_locked(inner).await;
        self.notify(CallNotification::CallFailed {
            reason: reason.clone(),
        });
        Err(CallError::Negotiation(reason))
    }

    /// Mark the call ended for the other side (best effort), then tear
    /// down locally. Used on every failure path after a `calls` row may
    /// already exist.
    async fn abort_call_locked(&self, inner: &mut SessionInner) {
        if let Some(call_id) = inner.state.call_id {
            if let Err(e) = self
                .relay
                .update_call_status(call_id, CallStatus::Ended, Some(TimestampField::EndedAt))
                .await
            {
                warn!(call = %call_id.short(), error = %e, "failed to mark aborted call as ended");
            }
        }
        self.teardown_locked(inner).await;
    }

    /// Release everything and return to idle. Media is closed before
    /// the tasks are aborted: a pump may be the task driving this very
    /// teardown, and aborting it first would cancel the close.
    async fn teardown_locked(&self, inner: &mut SessionInner) {
        if let Some(media) = inner.media_session.take() {
            media.close().await;
        }
        inner.state.reset();
        for task in inner.tasks.drain(..) {
            task.abort();
        }
    }

    fn notify(&self, notification: CallNotification) {
        if self.notifications.try_send(notification).is_err() {
            warn!("dropping call notification; channel full or closed");
        }
    }

    fn notify_setup_failure(&self, error: &CallError) {
        match error {
            CallError::Media(e) if e.is_access_error() => {
                self.notify(CallNotification::MicrophoneRequired)
            }
            e => self.notify(CallNotification::CallFailed {
                reason: e.to_string(),
            }),
        }
    }
}
