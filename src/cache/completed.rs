//! Cache of completed session output
//!
//! Entries are kept in recency order (least recent at the front). Each entry
//! owns a timer task that evicts it when its TTL runs out; the timer is
//! aborted when the entry is replaced or evicted first. Expired entries are
//! also dropped on lookup, so a late timer can never serve stale data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::CachePolicy;
use crate::registry::StreamKey;

struct CacheEntry {
    key: StreamKey,
    data: Bytes,
    expires_at: Instant,
    id: u64,
    timer: Option<JoinHandle<()>>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn discard(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

/// Completed outputs keyed by stream key
pub struct CompletedCache {
    policy: CachePolicy,
    entries: Mutex<VecDeque<CacheEntry>>,
    next_id: AtomicU64,
}

impl CompletedCache {
    /// Create an empty cache
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Eviction policy
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `data` under `key` for `ttl`
    ///
    /// Replaces any previous entry for the key, then makes room according to
    /// the policy.
    pub fn insert(self: &Arc<Self>, key: StreamKey, data: Bytes, ttl: Duration) {
        let mut entries = self.lock();

        if let Some(pos) = entries.iter().position(|e| e.key == key) {
            if let Some(old) = entries.remove(pos) {
                old.discard();
            }
        }

        let evicted = match self.policy {
            CachePolicy::SingleSlot => entries.len(),
            CachePolicy::Lru { capacity } => (entries.len() + 1).saturating_sub(capacity.max(1)),
        };
        for old in entries.drain(..evicted) {
            tracing::info!(stream = %old.key, "Cache entry evicted");
            old.discard();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + ttl;
        let timer = self.spawn_expiry(key.clone(), id, expires_at);

        tracing::info!(
            stream = %key,
            bytes = data.len(),
            ttl_secs = ttl.as_secs(),
            "Cache entry stored"
        );

        entries.push_back(CacheEntry {
            key,
            data,
            expires_at,
            id,
            timer,
        });
    }

    fn spawn_expiry(
        self: &Arc<Self>,
        key: StreamKey,
        id: u64,
        expires_at: Instant,
    ) -> Option<JoinHandle<()>> {
        // Without a runtime, lookups still drop the entry once it expires
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let cache: Weak<Self> = Arc::downgrade(self);

        Some(runtime.spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            if let Some(cache) = cache.upgrade() {
                cache.expire(&key, id);
            }
        }))
    }

    fn expire(&self, key: &StreamKey, id: u64) {
        let mut entries = self.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            // Running inside this entry's timer; let the handle drop
            entries.remove(pos);
            tracing::info!(stream = %key, "Cache entry expired");
        }
    }

    /// Cached output for `key`, if present and not expired
    ///
    /// A hit makes the entry the most recently used.
    pub fn get(&self, key: &StreamKey) -> Option<Bytes> {
        let mut entries = self.lock();
        let pos = entries.iter().position(|e| &e.key == key)?;
        let entry = entries.remove(pos)?;

        if entry.is_expired(Instant::now()) {
            tracing::debug!(stream = %key, "Dropped expired cache entry");
            entry.discard();
            return None;
        }

        let data = entry.data.clone();
        entries.push_back(entry);
        Some(data)
    }

    /// Drop the entry for `key`
    pub fn remove(&self, key: &StreamKey) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|e| &e.key == key) {
            Some(pos) => {
                if let Some(entry) = entries.remove(pos) {
                    entry.discard();
                }
                true
            }
            None => false,
        }
    }

    /// Number of stored entries, including any expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.lock();
        for entry in entries.drain(..) {
            entry.discard();
        }
    }
}

impl std::fmt::Debug for CompletedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedCache")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AudioFormat;

    fn key(id: &str) -> StreamKey {
        StreamKey::new(id, AudioFormat::Mp3).unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_single_slot_keeps_latest_only() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::SingleSlot));

        cache.insert(key("a"), Bytes::from_static(b"aaa"), TTL);
        cache.insert(key("b"), Bytes::from_static(b"bbb"), TTL);

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.get(&key("b")).unwrap(), "bbb");
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::Lru { capacity: 2 }));

        cache.insert(key("a"), Bytes::from_static(b"a"), TTL);
        cache.insert(key("b"), Bytes::from_static(b"b"), TTL);
        // Touch "a" so "b" becomes the eviction candidate
        assert!(cache.get(&key("a")).is_some());
        cache.insert(key("c"), Bytes::from_static(b"c"), TTL);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::SingleSlot));
        cache.insert(key("a"), Bytes::from_static(b"data"), TTL);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(cache.get(&key("a")).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_replaces_timer() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::Lru { capacity: 4 }));
        cache.insert(key("a"), Bytes::from_static(b"old"), Duration::from_secs(10));
        cache.insert(key("a"), Bytes::from_static(b"new"), Duration::from_secs(100));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).unwrap(), "new");
    }

    #[test]
    fn test_lazy_expiry_without_runtime() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::SingleSlot));
        cache.insert(key("a"), Bytes::from_static(b"x"), Duration::ZERO);

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = Arc::new(CompletedCache::new(CachePolicy::Lru { capacity: 3 }));
        cache.insert(key("a"), Bytes::from_static(b"a"), TTL);
        cache.insert(key("b"), Bytes::from_static(b"b"), TTL);

        assert!(cache.remove(&key("a")));
        assert!(!cache.remove(&key("a")));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
