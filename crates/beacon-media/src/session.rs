//! The seam between the call state machine and the transport layer.
//!
//! The state machine only sees these traits; production code opens
//! [`crate::WebRtcBackend`] sessions, tests drive the machine with a
//! scripted session.

use async_trait::async_trait;
use tokio::sync::mpsc;

use beacon_shared::{CandidatePayload, SessionDescription};

use crate::capture::CaptureConfig;
use crate::error::MediaError;

/// Transport configuration. STUN only — calls between peers behind
/// symmetric NAT will fail to connect; there is no TURN fallback.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub stun_servers: Vec<String>,
    pub capture: CaptureConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            capture: CaptureConfig::default(),
        }
    }
}

/// One open media session: the local capture device plus one peer
/// connection. Exactly one may be open per client at a time; the state
/// machine guards this.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Stream of locally discovered ICE candidates, to be forwarded to
    /// the relay for the lifetime of the session. Yields `None` on the
    /// second call — there is one consumer.
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidatePayload>>;

    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer and set it as the local description. Requires a
    /// remote offer to have been applied.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply the counterpart's description. Unblocks any candidates that
    /// arrived early.
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;

    /// Apply one remote ICE candidate. Candidates arriving before the
    /// remote description are queued, not dropped; duplicate application
    /// of the same candidate is a no-op.
    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError>;

    /// Flip the local audio track's enabled state. No renegotiation.
    fn set_muted(&self, muted: bool);

    /// Stop local tracks, close the peer connection, detach playback.
    /// Idempotent — closing a closed session is a no-op.
    async fn close(&self);
}

/// Factory for media sessions.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Request exclusive microphone access and build a peer connection.
    /// A [`MediaError::NoInputDevice`] here aborts call setup.
    async fn open(&self) -> Result<Box<dyn MediaSession>, MediaError>;
}
