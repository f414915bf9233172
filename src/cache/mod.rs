//! Completed-output cache
//!
//! Once a session completes, its whole output is kept for a while so repeat
//! requests are answered without spawning a new pipeline.

pub mod completed;

use std::time::Duration;

pub use completed::CompletedCache;

/// How the cache makes room for a new entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Keep only the most recent completion; every insert clears the rest
    #[default]
    SingleSlot,
    /// Keep up to `capacity` entries, evicting the least recently used
    Lru {
        /// Maximum number of entries (at least 1)
        capacity: usize,
    },
}

/// Time to keep a completed output: the source duration, clamped to `[min, max]`
///
/// A `max` below `min` is treated as `min`.
pub fn cache_ttl(duration: Duration, min: Duration, max: Duration) -> Duration {
    duration.max(min).min(max.max(min))
}
