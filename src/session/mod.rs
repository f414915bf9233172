//! Transcode sessions
//!
//! This module provides:
//! - The session entity: append-only output buffer plus live fan-out
//! - Listeners that replay the buffer and then follow live output
//! - The phase state machine and idle teardown
//! - The driver task that applies pipeline events to a session

pub(crate) mod driver;
pub mod entry;
pub mod listener;
pub mod state;

pub use entry::Session;
pub use listener::{ListenerHandle, LiveListener};
pub use state::{SessionPhase, StopReason};
