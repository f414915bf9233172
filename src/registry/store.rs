//! Session registry implementation
//!
//! Maps each stream key to at most one live session. Creation is
//! single-flight: concurrent requests for the same key share one slot and
//! only the first runs the factory; the rest wait for its outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};

use super::frame::StreamKey;
use crate::error::Result;
use crate::session::Session;
use crate::stats::SessionStats;

type Slot = Arc<OnceCell<Arc<Session>>>;

/// How a caller obtained its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This call ran the factory
    Created,
    /// The session already existed or was created by a concurrent call
    Joined,
}

/// Registry of live sessions
///
/// Thread-safe via `RwLock`. Lookups take the read lock; the write lock is
/// only held to insert or remove a slot, never across session creation.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<StreamKey, Slot>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the session for `key`, creating it with `factory` if there is none
    ///
    /// If the factory fails, the error is returned to this caller, the empty
    /// slot is dropped and the next request starts afresh.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &StreamKey,
        factory: F,
    ) -> Result<(Arc<Session>, Admission)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Session>>>,
    {
        let slot = self.slot(key).await;

        let mut created = false;
        let result = slot
            .get_or_try_init(|| {
                created = true;
                factory()
            })
            .await;

        match result {
            Ok(session) => {
                let admission = if created {
                    Admission::Created
                } else {
                    Admission::Joined
                };
                Ok((Arc::clone(session), admission))
            }
            Err(e) => {
                self.discard_empty_slot(key, &slot).await;
                Err(e)
            }
        }
    }

    async fn slot(&self, key: &StreamKey) -> Slot {
        if let Some(slot) = self.sessions.read().await.get(key) {
            return Arc::clone(slot);
        }

        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(key.clone()).or_default())
    }

    async fn discard_empty_slot(&self, key: &StreamKey, slot: &Slot) {
        let mut sessions = self.sessions.write().await;

        // Leave the slot alone if another waiter is still trying to fill it
        let ours = sessions
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot));
        if ours && !slot.initialized() && Arc::strong_count(slot) == 2 {
            sessions.remove(key);
        }
    }

    /// Remove whatever is registered for `key`
    pub async fn remove(&self, key: &StreamKey) -> bool {
        let removed = self.sessions.write().await.remove(key).is_some();
        if removed {
            tracing::debug!(stream = %key, "Session slot removed");
        }
        removed
    }

    /// Remove the session for `key` only if it is the session with `session_id`
    ///
    /// A finished session deregisters itself this way without clobbering a
    /// newer session that already replaced it.
    pub async fn remove_session(&self, key: &StreamKey, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;

        let matches = sessions
            .get(key)
            .and_then(|slot| slot.get())
            .is_some_and(|session| session.id() == session_id);

        if matches {
            sessions.remove(key);
            tracing::debug!(stream = %key, session_id = session_id, "Session deregistered");
        }
        matches
    }

    /// Live session for `key`, if one is registered
    pub async fn get(&self, key: &StreamKey) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(key).and_then(|slot| slot.get()).cloned()
    }

    /// Whether a session is registered for `key`
    pub async fn contains(&self, key: &StreamKey) -> bool {
        self.get(key).await.is_some()
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|slot| slot.initialized()).count()
    }

    /// Statistics for the session registered under `key`
    pub async fn session_stats(&self, key: &StreamKey) -> Option<SessionStats> {
        self.get(key).await.map(|session| session.stats())
    }

    /// All registered sessions
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
