//! Broadcaster configuration

use std::time::Duration;

use crate::cache::CachePolicy;

/// Broadcaster configuration options
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long a session with no listeners and unfinished output survives
    pub idle_grace: Duration,

    /// Live sink capacity per session, in chunks. Listeners further behind
    /// than this recover from the session buffer.
    pub live_capacity: usize,

    /// Eviction policy for completed outputs
    pub cache_policy: CachePolicy,

    /// Shortest time a completed output is kept
    pub cache_min_ttl: Duration,

    /// Longest time a completed output is kept
    pub cache_max_ttl: Duration,

    /// Attempts to attach when the session found closes under the caller
    pub max_attach_attempts: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(5),
            live_capacity: 256,
            cache_policy: CachePolicy::SingleSlot,
            cache_min_ttl: Duration::from_secs(60),
            cache_max_ttl: Duration::from_secs(20 * 60),
            max_attach_attempts: 3,
        }
    }
}

impl BroadcastConfig {
    /// Set the idle grace window
    pub fn idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace = grace;
        self
    }

    /// Set the live sink capacity (at least 1)
    pub fn live_capacity(mut self, capacity: usize) -> Self {
        self.live_capacity = capacity.max(1);
        self
    }

    /// Set the cache eviction policy
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Set the cache TTL bounds
    pub fn cache_ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.cache_min_ttl = min;
        self.cache_max_ttl = max.max(min);
        self
    }

    /// Set the attach retry limit (at least 1)
    pub fn max_attach_attempts(mut self, attempts: usize) -> Self {
        self.max_attach_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BroadcastConfig::default();

        assert_eq!(config.idle_grace, Duration::from_secs(5));
        assert_eq!(config.live_capacity, 256);
        assert_eq!(config.cache_policy, CachePolicy::SingleSlot);
        assert_eq!(config.cache_min_ttl, Duration::from_secs(60));
        assert_eq!(config.cache_max_ttl, Duration::from_secs(1200));
        assert_eq!(config.max_attach_attempts, 3);
    }

    #[test]
    fn test_builder_live_capacity_floor() {
        let config = BroadcastConfig::default().live_capacity(0);

        assert_eq!(config.live_capacity, 1);
    }

    #[test]
    fn test_builder_ttl_bounds_ordered() {
        let config = BroadcastConfig::default()
            .cache_ttl_bounds(Duration::from_secs(30), Duration::from_secs(10));

        assert_eq!(config.cache_min_ttl, Duration::from_secs(30));
        assert_eq!(config.cache_max_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_builder_chaining() {
        let config = BroadcastConfig::default()
            .idle_grace(Duration::from_secs(2))
            .live_capacity(8)
            .cache_policy(CachePolicy::Lru { capacity: 4 })
            .cache_ttl_bounds(Duration::from_secs(1), Duration::from_secs(10))
            .max_attach_attempts(0);

        assert_eq!(config.idle_grace, Duration::from_secs(2));
        assert_eq!(config.live_capacity, 8);
        assert_eq!(config.cache_policy, CachePolicy::Lru { capacity: 4 });
        assert_eq!(config.cache_min_ttl, Duration::from_secs(1));
        assert_eq!(config.cache_max_ttl, Duration::from_secs(10));
        assert_eq!(config.max_attach_attempts, 1);
    }
}
