//! # beacon-media
//!
//! The media half of a Beacon call: exclusive ownership of the local
//! microphone, the transport-layer peer connection, and the negotiation
//! primitives (offer/answer/candidates) the call state machine drives.
//!
//! The state machine depends on the [`MediaBackend`] / [`MediaSession`]
//! traits; [`WebRtcBackend`] is the production implementation (STUN-only
//! ICE, no TURN fallback).

pub mod capture;
pub mod session;
pub mod webrtc_session;

mod error;

pub use capture::{AudioCapture, AudioPlayback, CaptureConfig};
pub use error::MediaError;
pub use session::{MediaBackend, MediaConfig, MediaSession};
pub use webrtc_session::{WebRtcBackend, WebRtcSession};
