//! Broadcaster implementation

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::config::BroadcastConfig;
use crate::cache::{cache_ttl, CompletedCache};
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineRequest, PipelineSpawner};
use crate::registry::{Admission, SessionRegistry, StreamKey};
use crate::session::driver::{Driver, DriverContext};
use crate::session::{ListenerHandle, Session, StopReason};
use crate::stats::{BroadcastStats, Counters};

/// A request for one stream
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Stream key (source id and target format)
    pub key: StreamKey,
    /// Location handed to the extractor
    pub source: String,
    /// Source duration, if the caller already knows it
    pub duration_hint: Option<Duration>,
}

impl StreamRequest {
    pub fn new(key: StreamKey, source: impl Into<String>) -> Self {
        Self {
            key,
            source: source.into(),
            duration_hint: None,
        }
    }

    /// Skip the metadata lookup by supplying the duration
    pub fn duration_hint(mut self, duration: Duration) -> Self {
        self.duration_hint = Some(duration);
        self
    }
}

/// Resolves the total duration of a source
///
/// Only consulted when a request creates a new session without a duration
/// hint. Failures surface to that request as [`Error::Metadata`](crate::Error::Metadata).
pub trait MetadataLookup: Send + Sync + 'static {
    fn duration(&self, request: &StreamRequest) -> impl Future<Output = Result<Duration>> + Send;
}

/// Metadata lookup that reports the same duration for every source
#[derive(Debug, Clone, Copy)]
pub struct FixedDuration(pub Duration);

impl MetadataLookup for FixedDuration {
    fn duration(&self, _request: &StreamRequest) -> impl Future<Output = Result<Duration>> + Send {
        let duration = self.0;
        async move { Ok(duration) }
    }
}

/// Shares one transcode per stream key among all of its listeners
pub struct Broadcaster<S, M> {
    config: BroadcastConfig,
    spawner: S,
    metadata: M,
    registry: Arc<SessionRegistry>,
    cache: Arc<CompletedCache>,
    counters: Arc<Counters>,
    next_session_id: AtomicU64,
}

impl<S: PipelineSpawner, M: MetadataLookup> Broadcaster<S, M> {
    /// Create a broadcaster
    pub fn new(config: BroadcastConfig, spawner: S, metadata: M) -> Self {
        let cache = Arc::new(CompletedCache::new(config.cache_policy));

        Self {
            config,
            spawner,
            metadata,
            registry: Arc::new(SessionRegistry::new()),
            cache,
            counters: Arc::new(Counters::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CompletedCache> {
        &self.cache
    }

    /// Serve a stream request
    ///
    /// Returns a replay of cached output if the stream completed recently,
    /// otherwise a live listener on the stream's session. Only the request
    /// that creates a session can see metadata or spawn errors; nothing is
    /// left registered when it does.
    pub async fn request(&self, request: StreamRequest) -> Result<ListenerHandle> {
        self.counters.record_request();
        let key = request.key.clone();

        if let Some(handle) = self.replay_cached(&key) {
            return Ok(handle);
        }

        let max_attempts = self.config.max_attach_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (registered_tx, registered_rx) = oneshot::channel();
            let mut replay = None;
            let admitted = {
                let (key, request, replay) = (&key, &request, &mut replay);
                self.registry
                    .get_or_create(key, move || async move {
                        // A session for this key may have completed since the first lookup
                        if let Some(handle) = self.replay_cached(key) {
                            *replay = Some(handle);
                            return Err(Error::SessionClosed(key.clone()));
                        }
                        self.create_session(request, registered_rx).await
                    })
                    .await
            };
            if let Some(handle) = replay {
                return Ok(handle);
            }
            let (session, admission) = admitted?;
            // Ignored when this request joined instead of creating
            let _ = registered_tx.send(());

            match session.attach() {
                Ok(listener) => {
                    if admission == Admission::Joined {
                        self.counters.record_join();
                        tracing::debug!(
                            stream = %key,
                            session_id = session.id(),
                            "Joined existing session"
                        );
                    }
                    return Ok(ListenerHandle::live(key, listener));
                }
                Err(e) => {
                    // Closed between lookup and attach
                    self.registry.remove_session(&key, session.id()).await;

                    tracing::debug!(
                        stream = %key,
                        session_id = session.id(),
                        attempt = attempt,
                        "Session closed before attach"
                    );

                    if attempt >= max_attempts {
                        return Err(e);
                    }

                    // A session that just completed may have filled the cache
                    if let Some(handle) = self.replay_cached(&key) {
                        return Ok(handle);
                    }
                }
            }
        }
    }

    fn replay_cached(&self, key: &StreamKey) -> Option<ListenerHandle> {
        let data = self.cache.get(key)?;
        self.counters.record_cache_hit();

        tracing::debug!(stream = %key, bytes = data.len(), "Serving cached output");
        Some(ListenerHandle::replay(key.clone(), data))
    }

    async fn create_session(
        &self,
        request: &StreamRequest,
        registered: oneshot::Receiver<()>,
    ) -> Result<Arc<Session>> {
        let key = &request.key;

        let duration = match request.duration_hint {
            Some(duration) => duration,
            None => self.metadata.duration(request).await?,
        };

        let Pipeline { events, control } = self.spawner.spawn(&PipelineRequest {
            key: key.clone(),
            source: request.source.clone(),
        })?;

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            key.clone(),
            self.config.idle_grace,
            self.config.live_capacity,
            control,
        ));
        // Torn down after the grace window if the creator never attaches
        session.arm_idle_timer();

        let ttl = cache_ttl(duration, self.config.cache_min_ttl, self.config.cache_max_ttl);
        let driver = Driver::new(
            Arc::clone(&session),
            events,
            duration,
            ttl,
            DriverContext {
                registry: Arc::clone(&self.registry),
                cache: Arc::clone(&self.cache),
                counters: Arc::clone(&self.counters),
            },
            registered,
        );
        tokio::spawn(driver.run());
        self.counters.record_spawn();

        tracing::info!(
            stream = %key,
            session_id = id,
            duration_secs = duration.as_secs(),
            "Session created"
        );

        Ok(session)
    }

    /// Broadcaster-wide statistics
    pub async fn stats(&self) -> BroadcastStats {
        let mut stats = self.counters.snapshot();
        stats.active_sessions = self.registry.session_count().await;
        stats.cached_entries = self.cache.len();
        stats
    }

    /// Force-stop every live session. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for session in self.registry.sessions().await {
            if session.force_stop(StopReason::Shutdown) {
                stopped += 1;
            }
        }

        tracing::info!(sessions = stopped, "Broadcaster shut down");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok, assert_pending};

    use tokio::sync::Notify;

    use super::*;
    use crate::pipeline::{AudioFormat, ChannelSpawner, DiagnosticSource, PipelineExit, PipelineFeed};

    type TestBroadcaster = Broadcaster<ChannelSpawner, FixedDuration>;

    fn broadcaster(config: BroadcastConfig) -> (TestBroadcaster, mpsc::UnboundedReceiver<PipelineFeed>) {
        let (spawner, feeds) = ChannelSpawner::new(64);
        let metadata = FixedDuration(Duration::from_secs(180));
        (Broadcaster::new(config, spawner, metadata), feeds)
    }

    fn request(id: &str) -> StreamRequest {
        let key = StreamKey::new(id, AudioFormat::Mp3).unwrap();
        StreamRequest::new(key, format!("https://www.youtube.com/watch?v={}", id))
    }

    async fn wait_deregistered(broadcaster: &TestBroadcaster, key: &StreamKey) {
        for _ in 0..1000 {
            if !broadcaster.registry().contains(key).await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session for {} never deregistered", key);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_pipeline() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let broadcaster = Arc::new(broadcaster);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let broadcaster = Arc::clone(&broadcaster);
            tasks.push(tokio::spawn(async move {
                broadcaster.request(request("hot")).await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(broadcaster.spawner().spawned(), 1);

        let feed = feeds.recv().await.unwrap();
        feed.output("first ").await;
        feed.output("second").await;
        feed.exit(PipelineExit::Success).await;

        for handle in handles {
            assert_eq!(handle.collect().await.unwrap(), "first second");
        }

        let stats = broadcaster.stats().await;
        assert_eq!(stats.requests, 8);
        assert_eq!(stats.joins, 7);
        assert_eq!(stats.sessions_spawned, 1);
    }

    #[tokio::test]
    async fn test_late_joiner_receives_identical_output() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());

        let early = broadcaster.request(request("abc")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        for i in 0..3u8 {
            feed.output(vec![i]).await;
        }

        // Let the driver apply the first chunks before joining
        let key = early.key().clone();
        while broadcaster.registry().session_stats(&key).await.unwrap().chunks < 3 {
            tokio::task::yield_now().await;
        }

        let late = broadcaster.request(request("abc")).await.unwrap();
        assert!(!late.is_replay());
        assert_eq!(late.session_id(), early.session_id());

        for i in 3..6u8 {
            feed.output(vec![i]).await;
        }
        feed.exit(PipelineExit::Success).await;

        let expected: Vec<u8> = (0..6).collect();
        assert_eq!(early.collect().await.unwrap(), expected);
        assert_eq!(late.collect().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_recv_waits_for_output() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let mut handle = broadcaster.request(request("slow")).await.unwrap();
        let feed = feeds.recv().await.unwrap();

        {
            let mut recv = tokio_test::task::spawn(handle.recv());
            assert_pending!(recv.poll());
        }

        feed.output("late").await;
        assert_eq!(assert_ok!(handle.recv().await).unwrap(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_torn_down_after_grace() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let key = request("idle").key;

        let handle = broadcaster.request(request("idle")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        feed.output("partial").await;

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!feed.is_killed());
        assert!(broadcaster.registry().contains(&key).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(feed.is_killed());
        wait_deregistered(&broadcaster, &key).await;

        let stats = broadcaster.stats().await;
        assert_eq!(stats.idle_teardowns, 1);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.cached_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_within_grace_keeps_pipeline() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let key = request("seek").key;

        drop(broadcaster.request(request("seek")).await.unwrap());
        let feed = feeds.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let _again = broadcaster.request(request("seek")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!feed.is_killed());
        assert!(broadcaster.registry().contains(&key).await);
        assert_eq!(broadcaster.spawner().spawned(), 1);
    }

    #[tokio::test]
    async fn test_completed_output_served_from_cache() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let key = request("done").key;

        let handle = broadcaster.request(request("done")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        feed.output("ab").await;
        feed.output("cd").await;
        feed.exit(PipelineExit::Success).await;

        assert_eq!(handle.collect().await.unwrap(), "abcd");
        wait_deregistered(&broadcaster, &key).await;

        let replay = broadcaster.request(request("done")).await.unwrap();
        assert!(replay.is_replay());
        assert_eq!(replay.content_type(), "audio/mpeg");
        assert_eq!(replay.collect().await.unwrap(), "abcd");

        assert_eq!(broadcaster.spawner().spawned(), 1);
        let stats = broadcaster.stats().await;
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.sessions_completed, 1);
        assert_eq!(stats.cached_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry_forces_respawn() {
        let (broadcaster, mut feeds) = broadcaster(
            BroadcastConfig::default()
                .cache_ttl_bounds(Duration::from_secs(60), Duration::from_secs(120)),
        );
        let key = request("ttl").key;

        // 180s source clamps to the 120s ceiling
        let handle = broadcaster.request(request("ttl")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        feed.output("x").await;
        feed.exit(PipelineExit::Success).await;
        handle.collect().await.unwrap();
        wait_deregistered(&broadcaster, &key).await;

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert!(broadcaster.request(request("ttl")).await.unwrap().is_replay());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let fresh = broadcaster.request(request("ttl")).await.unwrap();
        assert!(!fresh.is_replay());
        assert_eq!(broadcaster.spawner().spawned(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_staggered_listeners() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let broadcaster = Arc::new(broadcaster);

        let mut listeners = Vec::new();
        for delay in 0..3u64 {
            let broadcaster = Arc::clone(&broadcaster);
            listeners.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay)).await;
                let handle = broadcaster.request(request("trio")).await.unwrap();
                handle.collect().await.unwrap()
            }));
        }

        let producer = tokio::spawn(async move {
            let feed = feeds.recv().await.unwrap();
            for i in 0..10u8 {
                feed.output(vec![i]).await;
                feed.diagnostic(
                    DiagnosticSource::Transcoder,
                    format!("out_time_us={}\nprogress=continue\n", (i as u64 + 1) * 18_000_000),
                )
                .await;
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            feed.diagnostic(DiagnosticSource::Transcoder, "progress=end\n").await;
            feed.exit(PipelineExit::Success).await;
        });

        let expected: Vec<u8> = (0..10).collect();
        for listener in listeners {
            assert_eq!(listener.await.unwrap(), expected);
        }
        producer.await.unwrap();

        assert_eq!(broadcaster.spawner().spawned(), 1);
        assert_eq!(broadcaster.stats().await.joins, 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_listeners_without_caching() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let key = request("bad").key;

        let mut a = broadcaster.request(request("bad")).await.unwrap();
        let mut b = broadcaster.request(request("bad")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        feed.exit(PipelineExit::Failed {
            stage: DiagnosticSource::Extractor,
            code: Some(1),
            detail: "ERROR: Video unavailable".to_string(),
        })
        .await;

        for handle in [&mut a, &mut b] {
            let err = assert_err!(handle.recv().await);
            assert!(matches!(err, Error::PipelineFailed { .. }));
            assert!(err.to_string().contains("Video unavailable"));
            assert!(handle.recv().await.unwrap().is_none());
        }

        wait_deregistered(&broadcaster, &key).await;
        assert!(broadcaster.cache().is_empty());
        assert_eq!(broadcaster.stats().await.sessions_failed, 1);

        // The next request starts over
        let _retry = broadcaster.request(request("bad")).await.unwrap();
        assert_eq!(broadcaster.spawner().spawned(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_registered() {
        let (broadcaster, _feeds) = broadcaster(BroadcastConfig::default());
        broadcaster.spawner().fail_next_spawn();

        let result = broadcaster.request(request("nope")).await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
        assert_eq!(broadcaster.registry().session_count().await, 0);

        assert!(broadcaster.request(request("nope")).await.is_ok());
        assert_eq!(broadcaster.spawner().spawned(), 1);
    }

    struct BrokenLookup;

    impl MetadataLookup for BrokenLookup {
        fn duration(&self, request: &StreamRequest) -> impl Future<Output = Result<Duration>> + Send {
            let id = request.key.id.clone();
            async move { Err(Error::Metadata(format!("no duration for {}", id))) }
        }
    }

    #[tokio::test]
    async fn test_metadata_failure_leaves_nothing_registered() {
        let (spawner, _feeds) = ChannelSpawner::new(8);
        let broadcaster = Broadcaster::new(BroadcastConfig::default(), spawner, BrokenLookup);

        let result = broadcaster.request(request("meta")).await;
        assert!(matches!(result, Err(ref e) if e.is_admission()));
        assert_eq!(broadcaster.registry().session_count().await, 0);
        assert_eq!(broadcaster.spawner().spawned(), 0);

        // A duration hint skips the lookup entirely
        let hinted = request("meta").duration_hint(Duration::from_secs(30));
        assert!(broadcaster.request(hinted).await.is_ok());
        assert_eq!(broadcaster.spawner().spawned(), 1);
    }

    /// Blocks in the lookup until released, then fails
    struct GatedLookup {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl MetadataLookup for GatedLookup {
        fn duration(&self, _request: &StreamRequest) -> impl Future<Output = Result<Duration>> + Send {
            async move {
                self.entered.notify_one();
                self.release.notified().await;
                Err(Error::Metadata("source went away".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_waiting_request_rechecks_cache_before_spawning() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (spawner, _feeds) = ChannelSpawner::new(8);
        let broadcaster = Arc::new(Broadcaster::new(
            BroadcastConfig::default(),
            spawner,
            GatedLookup {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            },
        ));
        let key = request("race").key;

        let creator = tokio::spawn({
            let broadcaster = Arc::clone(&broadcaster);
            async move { broadcaster.request(request("race")).await }
        });
        entered.notified().await;

        // Misses the cache, then queues behind the creator
        let waiter = tokio::spawn({
            let broadcaster = Arc::clone(&broadcaster);
            async move { broadcaster.request(request("race")).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Output of an earlier session lands while the waiter is queued
        broadcaster
            .cache()
            .insert(key.clone(), Bytes::from_static(b"finished"), Duration::from_secs(60));
        release.notify_one();

        assert!(matches!(creator.await.unwrap(), Err(Error::Metadata(_))));
        let handle = waiter.await.unwrap().unwrap();
        assert!(handle.is_replay());
        assert_eq!(handle.collect().await.unwrap(), "finished");

        assert_eq!(broadcaster.spawner().spawned(), 0);
        assert_eq!(broadcaster.registry().session_count().await, 0);
        assert!(!broadcaster.registry().contains(&key).await);
    }

    #[tokio::test]
    async fn test_malformed_diagnostics_do_not_disturb_the_stream() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let key = request("noisy").key;

        let handle = broadcaster.request(request("noisy")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        feed.output("a").await;
        feed.diagnostic(DiagnosticSource::Transcoder, "out_time=00:00:1e30\n").await;
        feed.diagnostic(DiagnosticSource::Transcoder, "time=9999999999999999:00:00.00\n").await;
        feed.diagnostic(
            DiagnosticSource::Extractor,
            "[download]  10.0% of 3.42MiB at 1.00KiB/s ETA 9999999999999999999:00:00\n",
        )
        .await;
        feed.output("b").await;
        feed.exit(PipelineExit::Success).await;

        assert_eq!(handle.collect().await.unwrap(), "ab");
        wait_deregistered(&broadcaster, &key).await;
        assert!(broadcaster.request(request("noisy")).await.unwrap().is_replay());
        assert_eq!(broadcaster.stats().await.sessions_completed, 1);
    }

    #[tokio::test]
    async fn test_lagging_listener_loses_nothing() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default().live_capacity(2));

        let handle = broadcaster.request(request("lag")).await.unwrap();
        let feed = feeds.recv().await.unwrap();
        for i in 0..50u8 {
            feed.output(vec![i]).await;
        }
        feed.exit(PipelineExit::Success).await;

        let expected: Vec<u8> = (0..50).collect();
        assert_eq!(handle.collect().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_shutdown_stops_live_sessions() {
        let (broadcaster, mut feeds) = broadcaster(BroadcastConfig::default());
        let mut handle = broadcaster.request(request("live")).await.unwrap();
        let feed = feeds.recv().await.unwrap();

        assert_eq!(broadcaster.shutdown().await, 1);
        assert!(feed.is_killed());
        assert!(matches!(handle.recv().await, Err(Error::SessionClosed(_))));
        assert_eq!(broadcaster.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_lru_cache_keeps_several_streams() {
        let (broadcaster, mut feeds) = broadcaster(
            BroadcastConfig::default().cache_policy(crate::cache::CachePolicy::Lru { capacity: 2 }),
        );

        for id in ["one", "two"] {
            let handle = broadcaster.request(request(id)).await.unwrap();
            let feed = feeds.recv().await.unwrap();
            feed.output(Bytes::from(id)).await;
            feed.exit(PipelineExit::Success).await;
            handle.collect().await.unwrap();
            wait_deregistered(&broadcaster, &request(id).key).await;
        }

        assert!(broadcaster.request(request("one")).await.unwrap().is_replay());
        assert!(broadcaster.request(request("two")).await.unwrap().is_replay());
        assert_eq!(broadcaster.stats().await.cached_entries, 2);
    }
}
