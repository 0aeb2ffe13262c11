//! # beacon-call
//!
//! Peer-to-peer call orchestration for Beacon clients: the client-local
//! call state machine, the event-sourced signaling flows (offer, answer,
//! ICE candidates relayed through the datastore), and the controller
//! that surfaces inbound calls and drives the whole lifecycle.
//!
//! The building blocks live in the sibling crates: `beacon-relay` owns
//! the `calls` / `call_signals` tables, `beacon-media` owns the
//! microphone and the peer connection.

pub mod controller;
pub mod events;
pub mod session;
pub mod state;

mod error;

pub use controller::CallController;
pub use error::CallError;
pub use events::{CallEvent, CallNotification, UserAction};
pub use session::CallSession;
pub use state::{CallPhase, CallSessionState};
