//! Request handling: cache, join or create, attach
//!
//! [`Broadcaster`] is the entry point. A request is answered from the
//! completed-output cache when possible, otherwise it joins the live session
//! for its key, creating one (and spawning its pipeline) if none exists.

pub mod broadcaster;
pub mod config;

pub use broadcaster::{Broadcaster, FixedDuration, MetadataLookup, StreamRequest};
pub use config::BroadcastConfig;
