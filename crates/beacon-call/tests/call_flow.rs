//! End-to-end call flows over the in-memory relay, with a scripted
//! media backend standing in for the transport layer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_call::{CallController, CallError, CallEvent, CallNotification, CallPhase, CallSession};
use beacon_media::{MediaBackend, MediaError, MediaSession};
use beacon_relay::{MemoryDirectory, MemoryRelay, SignalRelay};
use beacon_shared::{CallStatus, CandidatePayload, ConversationId, SessionDescription, UserId};

/// Observable state of one scripted media session.
#[derive(Default)]
struct Probe {
    remote_descriptions: Vec<SessionDescription>,
    applied: Vec<CandidatePayload>,
    queued: Vec<CandidatePayload>,
    seen: HashSet<String>,
    offers: usize,
    answers: usize,
    muted: bool,
    closed: bool,
}

struct ScriptedSession {
    sdp: String,
    probe: Arc<StdMutex<Probe>>,
    candidates: StdMutex<Option<mpsc::Receiver<CandidatePayload>>>,
}

#[async_trait]
impl MediaSession for ScriptedSession {
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidatePayload>> {
        self.candidates.lock().unwrap().take()
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let mut probe = self.probe.lock().unwrap();
        probe.offers += 1;
        Ok(SessionDescription::offer(self.sdp.clone()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let mut probe = self.probe.lock().unwrap();
        if probe.remote_descriptions.is_empty() {
            return Err(MediaError::WebRtc("no remote description".into()));
        }
        probe.answers += 1;
        Ok(SessionDescription::answer(self.sdp.clone()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let mut probe = self.probe.lock().unwrap();
        probe.remote_descriptions.push(description);
        let queued = std::mem::take(&mut probe.queued);
        probe.applied.extend(queued);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
        let mut probe = self.probe.lock().unwrap();
        if !probe.seen.insert(candidate.candidate.clone()) {
            return Ok(());
        }
        if probe.remote_descriptions.is_empty() {
            probe.queued.push(candidate);
        } else {
            probe.applied.push(candidate);
        }
        Ok(())
    }

    fn set_muted(&self, muted: bool) {
        self.probe.lock().unwrap().muted = muted;
    }

    async fn close(&self) {
        self.probe.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
struct ScriptedBackend {
    sdp: String,
    fail_open: bool,
    local_candidates: Vec<CandidatePayload>,
    sessions: StdMutex<Vec<Arc<StdMutex<Probe>>>>,
}

impl ScriptedBackend {
    fn new(sdp: &str) -> Arc<Self> {
        Arc::new(Self {
            sdp: sdp.to_string(),
            ..Default::default()
        })
    }

    fn with_candidates(sdp: &str, local_candidates: Vec<CandidatePayload>) -> Arc<Self> {
        Arc::new(Self {
            sdp: sdp.to_string(),
            local_candidates,
            ..Default::default()
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_open: true,
            ..Default::default()
        })
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn session(&self, index: usize) -> Arc<StdMutex<Probe>> {
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl MediaBackend for ScriptedBackend {
    async fn open(&self) -> Result<Box<dyn MediaSession>, MediaError> {
        if self.fail_open {
            return Err(MediaError::NoInputDevice);
        }
        let probe = Arc::new(StdMutex::new(Probe::default()));
        self.sessions.lock().unwrap().push(probe.clone());
        let (tx, rx) = mpsc::channel(self.local_candidates.len().max(1));
        for candidate in &self.local_candidates {
            let _ = tx.try_send(candidate.clone());
        }
        Ok(Box::new(ScriptedSession {
            sdp: self.sdp.clone(),
            probe,
            candidates: StdMutex::new(Some(rx)),
        }))
    }
}

fn cand(s: &str) -> CandidatePayload {
    CandidatePayload {
        candidate: s.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Let the background pumps catch up.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn drain(rx: &mut mpsc::Receiver<CallNotification>) -> Vec<CallNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

struct Peer {
    user: UserId,
    controller: Arc<CallController>,
    notifications: mpsc::Receiver<CallNotification>,
    backend: Arc<ScriptedBackend>,
}

async fn peer(
    relay: &Arc<MemoryRelay>,
    directory: &Arc<MemoryDirectory>,
    username: &str,
    backend: Arc<ScriptedBackend>,
) -> Peer {
    let user = UserId::new();
    directory.insert_profile(user, username);
    let (controller, notifications) =
        CallController::new(user, relay.clone(), directory.clone(), backend.clone());
    controller.start().await.unwrap();
    Peer {
        user,
        controller,
        notifications,
        backend,
    }
}

#[tokio::test]
async fn direct_call_connects_end_to_end() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let mut alice = peer(
        &relay,
        &directory,
        "alice",
        ScriptedBackend::with_candidates("sdp-alice", vec![cand("candidate:a1"), cand("candidate:a2")]),
    )
    .await;
    let mut bob = peer(
        &relay,
        &directory,
        "bob",
        ScriptedBackend::with_candidates("sdp-bob", vec![cand("candidate:b1")]),
    )
    .await;

    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user, bob.user]);

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;

    assert_eq!(
        drain(&mut alice.notifications),
        vec![CallNotification::OutgoingCall {
            conversation_id: conversation,
            display_name: "bob".to_string(),
            is_group: false,
        }]
    );

    let call_id = alice.controller.call_state().await.call_id.unwrap();
    let incoming = drain(&mut bob.notifications);
    assert_eq!(
        incoming,
        vec![CallNotification::IncomingCall {
            call_id,
            conversation_id: conversation,
            display_name: "alice".to_string(),
            is_group: false,
        }]
    );
    assert_eq!(bob.controller.call_state().await.phase, CallPhase::Ringing);

    bob.controller.answer().await.unwrap();
    settle().await;

    assert_eq!(alice.controller.call_state().await.phase, CallPhase::Active);
    assert_eq!(bob.controller.call_state().await.phase, CallPhase::Active);

    let row = relay.get_call(call_id).unwrap();
    assert_eq!(row.status, CallStatus::Active);
    assert!(row.started_at.is_some());

    // Each side applied exactly the counterpart's description, once.
    let alice_probe = alice.backend.session(0);
    let bob_probe = bob.backend.session(0);
    {
        let probe = alice_probe.lock().unwrap();
        assert_eq!(
            probe.remote_descriptions,
            vec![SessionDescription::answer("sdp-bob")]
        );
        assert_eq!(probe.offers, 1);
    }
    {
        let probe = bob_probe.lock().unwrap();
        assert_eq!(
            probe.remote_descriptions,
            vec![SessionDescription::offer("sdp-alice")]
        );
        assert_eq!(probe.answers, 1);
    }

    // Candidates crossed exactly once each, despite backfill overlapping
    // the push stream.
    let applied = |probe: &Arc<StdMutex<Probe>>| -> Vec<String> {
        let probe = probe.lock().unwrap();
        probe.applied.iter().map(|c| c.candidate.clone()).collect()
    };
    let mut bob_applied = applied(&bob_probe);
    bob_applied.sort();
    assert_eq!(bob_applied, vec!["candidate:a1", "candidate:a2"]);
    assert_eq!(applied(&alice_probe), vec!["candidate:b1"]);

    alice.controller.end().await.unwrap();
    settle().await;

    let row = relay.get_call(call_id).unwrap();
    assert_eq!(row.status, CallStatus::Ended);
    assert!(row.ended_at.is_some());
    assert!(alice.controller.call_state().await.is_idle());
    assert!(bob.controller.call_state().await.is_idle());
    assert!(alice_probe.lock().unwrap().closed);
    assert!(bob_probe.lock().unwrap().closed);
    assert_eq!(drain(&mut bob.notifications), vec![CallNotification::CallEnded]);
}

#[tokio::test]
async fn starting_a_second_call_is_refused() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;
    let bob = peer(&relay, &directory, "bob", ScriptedBackend::new("sdp-b")).await;

    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user, bob.user]);

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;

    // Caller is busy.
    let err = alice
        .controller
        .start_call(ConversationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::AlreadyInCall));

    // So is the ringing callee.
    assert_eq!(bob.controller.call_state().await.phase, CallPhase::Ringing);
    let err = bob
        .controller
        .start_call(ConversationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::AlreadyInCall));
}

#[tokio::test]
async fn declined_call_resets_both_sides() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let mut alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;
    let mut bob = peer(&relay, &directory, "bob", ScriptedBackend::new("sdp-b")).await;

    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user, bob.user]);

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;
    let call_id = alice.controller.call_state().await.call_id.unwrap();

    bob.controller.decline().await.unwrap();
    settle().await;

    assert_eq!(relay.get_call(call_id).unwrap().status, CallStatus::Declined);
    assert!(alice.controller.call_state().await.is_idle());
    assert!(bob.controller.call_state().await.is_idle());

    // Declining never touches the microphone.
    assert_eq!(bob.backend.session_count(), 0);
    assert!(alice.backend.session(0).lock().unwrap().closed);

    drain(&mut bob.notifications);
    let alice_notes = drain(&mut alice.notifications);
    assert!(alice_notes.contains(&CallNotification::CallDeclined));
}

#[tokio::test]
async fn caller_microphone_failure_aborts_before_any_relay_write() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let mut alice = peer(&relay, &directory, "alice", ScriptedBackend::failing()).await;
    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user]);

    let err = alice.controller.start_call(conversation).await.unwrap_err();
    assert!(matches!(err, CallError::Media(MediaError::NoInputDevice)));

    // No call row was inserted; nothing rings on the other side.
    assert!(relay.calls_for_conversation(conversation).is_empty());
    assert!(alice.controller.call_state().await.is_idle());
    assert_eq!(
        drain(&mut alice.notifications),
        vec![CallNotification::MicrophoneRequired]
    );
}

#[tokio::test]
async fn callee_microphone_failure_rolls_back_the_optimistic_answer() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let mut alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;
    let mut bob = peer(&relay, &directory, "bob", ScriptedBackend::failing()).await;

    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user, bob.user]);

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;
    let call_id = alice.controller.call_state().await.call_id.unwrap();

    let err = bob.controller.answer().await.unwrap_err();
    assert!(matches!(err, CallError::Media(MediaError::NoInputDevice)));
    settle().await;

    // The failed answer marks the call ended so the caller is not left
    // ringing forever.
    assert_eq!(relay.get_call(call_id).unwrap().status, CallStatus::Ended);
    assert!(bob.controller.call_state().await.is_idle());
    assert!(alice.controller.call_state().await.is_idle());

    let bob_notes = drain(&mut bob.notifications);
    assert!(bob_notes.contains(&CallNotification::MicrophoneRequired));
    let alice_notes = drain(&mut alice.notifications);
    assert!(alice_notes.contains(&CallNotification::CallEnded));
}

#[tokio::test]
async fn early_candidates_apply_exactly_once() {
    let relay = Arc::new(MemoryRelay::new());
    let backend = ScriptedBackend::new("sdp-caller");
    let (tx, _notifications) = mpsc::channel(16);

    let alice = UserId::new();
    let session = CallSession::new(alice, relay.clone(), backend.clone(), tx);
    session.start_call(ConversationId::new()).await.unwrap();
    let call_id = session.state().await.call_id.unwrap();

    let bob = UserId::new();
    let candidate = cand("candidate:early");
    for _ in 0..2 {
        session
            .dispatch(CallEvent::CandidateReceived {
                call_id,
                sender: bob,
                candidate: candidate.clone(),
            })
            .await
            .unwrap();
    }

    // Queued until the answer lands, and only once.
    let probe = backend.session(0);
    {
        let probe = probe.lock().unwrap();
        assert_eq!(probe.queued.len(), 1);
        assert!(probe.applied.is_empty());
    }

    session
        .dispatch(CallEvent::AnswerReceived {
            call_id,
            sender: bob,
            description: SessionDescription::answer("sdp-callee"),
        })
        .await
        .unwrap();
    assert_eq!(session.state().await.phase, CallPhase::Active);

    // A late duplicate is a no-op.
    session
        .dispatch(CallEvent::CandidateReceived {
            call_id,
            sender: bob,
            candidate: candidate.clone(),
        })
        .await
        .unwrap();

    let probe = probe.lock().unwrap();
    assert_eq!(probe.applied, vec![candidate]);
    assert!(probe.queued.is_empty());
}

#[tokio::test]
async fn stale_and_self_authored_signals_are_discarded() {
    let relay = Arc::new(MemoryRelay::new());
    let backend = ScriptedBackend::new("sdp-caller");
    let (tx, _notifications) = mpsc::channel(16);

    let alice = UserId::new();
    let session = CallSession::new(alice, relay.clone(), backend.clone(), tx);
    session.start_call(ConversationId::new()).await.unwrap();
    let call_id = session.state().await.call_id.unwrap();
    let bob = UserId::new();

    // Wrong call: dropped.
    session
        .dispatch(CallEvent::CandidateReceived {
            call_id: beacon_shared::CallId::new(),
            sender: bob,
            candidate: cand("candidate:stale"),
        })
        .await
        .unwrap();

    // Our own echo: dropped.
    session
        .dispatch(CallEvent::CandidateReceived {
            call_id,
            sender: alice,
            candidate: cand("candidate:echo"),
        })
        .await
        .unwrap();

    {
        let probe = backend.session(0);
        let probe = probe.lock().unwrap();
        assert!(probe.queued.is_empty());
        assert!(probe.applied.is_empty());
    }

    // The real thing still gets through.
    session
        .dispatch(CallEvent::CandidateReceived {
            call_id,
            sender: bob,
            candidate: cand("candidate:real"),
        })
        .await
        .unwrap();
    let probe = backend.session(0);
    assert_eq!(probe.lock().unwrap().queued.len(), 1);
}

#[tokio::test]
async fn mute_is_track_local_and_does_not_renegotiate() {
    let relay = Arc::new(MemoryRelay::new());
    let backend = ScriptedBackend::new("sdp-caller");
    let (tx, _notifications) = mpsc::channel(16);

    let session = CallSession::new(UserId::new(), relay.clone(), backend.clone(), tx);

    // Not in a call: refused.
    assert!(matches!(
        session.toggle_mute().await.unwrap_err(),
        CallError::InvalidState(_)
    ));

    session.start_call(ConversationId::new()).await.unwrap();
    let call_id = session.state().await.call_id.unwrap();
    let signals_before = relay.signals_for_call(call_id).len();

    session.toggle_mute().await.unwrap();
    assert!(session.state().await.is_muted);
    let probe = backend.session(0);
    assert!(probe.lock().unwrap().muted);

    session.toggle_mute().await.unwrap();
    assert!(!session.state().await.is_muted);
    assert!(!probe.lock().unwrap().muted);

    // No new offer, no new signal rows.
    assert_eq!(probe.lock().unwrap().offers, 1);
    assert_eq!(relay.signals_for_call(call_id).len(), signals_before);
}

#[tokio::test]
async fn answering_without_a_recorded_offer_fails_cleanly() {
    let relay = Arc::new(MemoryRelay::new());
    let backend = ScriptedBackend::new("sdp-callee");
    let (tx, mut notifications) = mpsc::channel(16);

    let bob = UserId::new();
    let conversation = ConversationId::new();
    let session = CallSession::new(bob, relay.clone(), backend.clone(), tx);

    // A ringing call whose offer signal never made it to the relay.
    let call = relay
        .create_call(conversation, UserId::new())
        .await
        .unwrap();
    assert!(session.ring(&call).await);

    let err = session.answer(call.id, conversation).await.unwrap_err();
    assert!(matches!(err, CallError::MissingOffer(_)));

    assert!(session.state().await.is_idle());
    assert_eq!(relay.get_call(call.id).unwrap().status, CallStatus::Ended);
    let notes = drain(&mut notifications);
    assert!(notes
        .iter()
        .any(|n| matches!(n, CallNotification::CallFailed { .. })));
}

#[tokio::test]
async fn hangup_when_idle_is_a_noop() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());
    let alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;

    alice.controller.end().await.unwrap();
    alice.controller.end().await.unwrap();
    assert!(alice.controller.call_state().await.is_idle());
}

#[tokio::test]
async fn group_call_uses_the_group_name() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let mut alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;
    let mut bob = peer(&relay, &directory, "bob", ScriptedBackend::new("sdp-b")).await;

    let conversation = ConversationId::new();
    directory.insert_conversation(
        conversation,
        Some("weekend plans".to_string()),
        true,
        vec![alice.user, bob.user],
    );

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;

    assert_eq!(
        drain(&mut alice.notifications),
        vec![CallNotification::OutgoingCall {
            conversation_id: conversation,
            display_name: "weekend plans".to_string(),
            is_group: true,
        }]
    );
    let call_id = alice.controller.call_state().await.call_id.unwrap();
    assert_eq!(
        drain(&mut bob.notifications),
        vec![CallNotification::IncomingCall {
            call_id,
            conversation_id: conversation,
            display_name: "weekend plans".to_string(),
            is_group: true,
        }]
    );
}

#[tokio::test]
async fn non_participants_never_ring() {
    let relay = Arc::new(MemoryRelay::new());
    let directory = Arc::new(MemoryDirectory::new());

    let alice = peer(&relay, &directory, "alice", ScriptedBackend::new("sdp-a")).await;
    let bob = peer(&relay, &directory, "bob", ScriptedBackend::new("sdp-b")).await;
    let mut mallory = peer(&relay, &directory, "mallory", ScriptedBackend::new("sdp-m")).await;

    let conversation = ConversationId::new();
    directory.insert_conversation(conversation, None, false, vec![alice.user, bob.user]);

    alice.controller.start_call(conversation).await.unwrap();
    settle().await;

    assert!(mallory.controller.call_state().await.is_idle());
    assert!(drain(&mut mallory.notifications).is_empty());
}
