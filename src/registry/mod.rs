//! Session registry and stream keys
//!
//! The registry maps stream keys to live transcode sessions so that every
//! request for the same key shares a single pipeline. Fan-out within a
//! session uses `tokio::sync::broadcast`.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌──────────────────────────┐
//!                   │ sessions: HashMap<Key,   │
//!                   │   OnceCell<Session {     │
//!                   │     buffer,              │
//!                   │     sink: broadcast::Tx, │
//!                   │   }>                     │
//!                   │ >                        │
//!                   └────────────┬─────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!        ▼                       ▼                       ▼
//!    [Driver]               [Listener]              [Listener]
//!    pipeline output        replay + rx.recv()      replay + rx.recv()
//!        │                       │                       │
//!        └──► session.push_chunk() ──► broadcast ──► HTTP body
//! ```
//!
//! # Zero-Copy Design
//!
//! `bytes::Bytes` uses reference counting, so all listeners share the same
//! allocation. The broadcast channel clones the `SinkEvent`, but the chunk
//! data itself is never copied.

pub mod frame;
pub mod store;

pub use frame::{SinkEvent, StreamKey};
pub use store::{Admission, SessionRegistry};
