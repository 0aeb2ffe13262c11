//! # beacon-relay
//!
//! The out-of-band channel for call negotiation: a thin, typed contract
//! over the hosted event-sourced datastore's `calls` and `call_signals`
//! tables, plus the read-only directory collaborator (conversation
//! membership and display metadata).
//!
//! The state machine in `beacon-call` depends only on the [`SignalRelay`]
//! and [`Directory`] traits. [`MemoryRelay`] and [`MemoryDirectory`]
//! implement them in-process for tests and local deployments; a hosted
//! deployment substitutes its own datastore-backed implementations.

pub mod directory;
pub mod memory;
pub mod relay;
pub mod rows;

mod error;

pub use directory::{ConversationInfo, Directory, MemoryDirectory, Profile};
pub use error::{RelayError, Result};
pub use memory::MemoryRelay;
pub use relay::{SignalRelay, TimestampField};
pub use rows::{CallRow, SignalRow};
