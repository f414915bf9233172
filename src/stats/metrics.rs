//! Statistics and metrics for transcode sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::session::SessionPhase;

/// Session-level statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Session id
    pub session_id: u64,
    /// Stream key (`id.ext`)
    pub stream_key: String,
    /// Current phase
    pub phase: SessionPhase,
    /// Attached listeners
    pub listener_count: usize,
    /// Highest listener count seen
    pub peak_listeners: usize,
    /// Transcode completion ratio
    pub progress: f64,
    /// Extractor download ratio, if reported
    pub download_ratio: Option<f64>,
    /// Chunks buffered
    pub chunks: usize,
    /// Bytes buffered
    pub bytes_buffered: usize,
    /// Time since the session was created
    pub age: Duration,
}

impl SessionStats {
    /// Output bitrate in bits per second, averaged over the session's age
    pub fn bitrate(&self) -> u64 {
        let secs = self.age.as_secs();
        if secs > 0 {
            (self.bytes_buffered as u64 * 8) / secs
        } else {
            0
        }
    }
}

/// Broadcaster-wide counters
///
/// Updated lock-free from request paths and session drivers.
#[derive(Debug, Default)]
pub struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    joins: AtomicU64,
    sessions_spawned: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    idle_teardowns: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spawn(&self) {
        self.sessions_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_teardown(&self) {
        self.idle_teardowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot into a [`BroadcastStats`]; gauges are left at zero
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            sessions_spawned: self.sessions_spawned.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            idle_teardowns: self.idle_teardowns.load(Ordering::Relaxed),
            active_sessions: 0,
            cached_entries: 0,
        }
    }
}

/// Broadcaster-wide statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    /// Total requests
    pub requests: u64,
    /// Requests served from the completed cache
    pub cache_hits: u64,
    /// Requests that joined an existing session
    pub joins: u64,
    /// Pipelines spawned
    pub sessions_spawned: u64,
    /// Sessions that completed and were cached
    pub sessions_completed: u64,
    /// Sessions whose pipeline failed
    pub sessions_failed: u64,
    /// Sessions stopped after their last listener left
    pub idle_teardowns: u64,
    /// Sessions currently registered
    pub active_sessions: usize,
    /// Entries currently cached
    pub cached_entries: usize,
}

impl BroadcastStats {
    /// Fraction of requests served from the cache
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.requests > 0 {
            self.cache_hits as f64 / self.requests as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: usize, age: Duration) -> SessionStats {
        SessionStats {
            session_id: 1,
            stream_key: "abc.mp3".to_string(),
            phase: SessionPhase::Running,
            listener_count: 0,
            peak_listeners: 0,
            progress: 0.0,
            download_ratio: None,
            chunks: 0,
            bytes_buffered: bytes,
            age,
        }
    }

    #[test]
    fn test_session_stats_bitrate() {
        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stats(1_000_000, Duration::from_secs(10)).bitrate(), 800_000);
    }

    #[test]
    fn test_session_stats_bitrate_zero_duration() {
        assert_eq!(stats(1_000_000, Duration::ZERO).bitrate(), 0);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::new();
        for _ in 0..4 {
            counters.record_request();
        }
        counters.record_cache_hit();
        counters.record_join();
        counters.record_spawn();
        counters.record_completed();
        counters.record_idle_teardown();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.joins, 1);
        assert_eq!(snapshot.sessions_spawned, 1);
        assert_eq!(snapshot.sessions_completed, 1);
        assert_eq!(snapshot.sessions_failed, 0);
        assert_eq!(snapshot.idle_teardowns, 1);
        assert_eq!(snapshot.cache_hit_ratio(), 0.25);
    }

    #[test]
    fn test_cache_hit_ratio_without_requests() {
        assert_eq!(BroadcastStats::default().cache_hit_ratio(), 0.0);
    }
}
