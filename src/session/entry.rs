//! Session: one in-flight transcode and its fan-out state
//!
//! The buffer, the live sink and the listener count are updated together
//! under one lock. A listener therefore attaches at an exact chunk index: it
//! replays `buffer[..n]` and receives `n, n + 1, ...` live, with no gap and no
//! duplicate. The lock is never held across an `.await`, and sending on the
//! broadcast sink never waits, so slow listeners cannot stall the producer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::pipeline::PipelineControl;
use crate::registry::{SinkEvent, StreamKey};
use crate::stats::SessionStats;

use super::listener::LiveListener;
use super::state::{SessionPhase, SessionState, StopReason};

/// One in-flight transcode for a stream key
pub struct Session {
    id: u64,
    key: StreamKey,
    created_at: Instant,
    idle_grace: Duration,
    state: Mutex<SessionState>,
    sink: broadcast::Sender<SinkEvent>,
    control: Box<dyn PipelineControl>,
    stop: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session owning the given pipeline control
    pub fn new(
        id: u64,
        key: StreamKey,
        idle_grace: Duration,
        live_capacity: usize,
        control: Box<dyn PipelineControl>,
    ) -> Self {
        let (sink, _) = broadcast::channel(live_capacity.max(1));

        Self {
            id,
            key,
            created_at: Instant::now(),
            idle_grace,
            state: Mutex::new(SessionState::new()),
            sink,
            control,
            stop: Notify::new(),
        }
    }

    /// Session id, unique per broadcaster
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream key
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    /// Current completion ratio
    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    /// Number of attached listeners
    pub fn listener_count(&self) -> usize {
        self.lock().listener_count
    }

    /// Whether an idle timer is pending
    pub fn has_idle_timer(&self) -> bool {
        self.lock().idle_timer.is_some()
    }

    /// Why the session was stopped, if it was
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.lock().stop_reason
    }

    /// Failure reason, if the pipeline failed
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        // Every critical section leaves the state consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new listener
    ///
    /// The listener first replays everything buffered so far, then follows
    /// the live sink. Cancels a pending idle timer. A completed session can
    /// still be attached and replays in full; a failed or stopped one is
    /// refused with [`Error::SessionClosed`].
    pub fn attach(self: &Arc<Self>) -> Result<LiveListener> {
        let mut state = self.lock();

        let terminal = match state.phase {
            SessionPhase::Running => None,
            SessionPhase::Completed => Some(SinkEvent::Completed),
            SessionPhase::Failed | SessionPhase::Stopped => {
                return Err(Error::SessionClosed(self.key.clone()))
            }
        };

        let rx = self.sink.subscribe();
        let replay = state.buffer.clone();
        state.add_listener();
        state.cancel_idle_timer();
        let listeners = state.listener_count;
        drop(state);

        tracing::debug!(
            stream = %self.key,
            session_id = self.id,
            listeners = listeners,
            replay_chunks = replay.len(),
            "Listener attached"
        );

        Ok(LiveListener::new(Arc::clone(self), rx, replay, terminal))
    }

    /// Detach a listener
    ///
    /// When the last listener leaves an unfinished session, the idle timer is
    /// armed; the session is stopped if nobody attaches within the grace window.
    pub fn detach(self: &Arc<Self>) {
        let mut state = self.lock();
        let remaining = state.remove_listener();

        tracing::debug!(
            stream = %self.key,
            session_id = self.id,
            listeners = remaining,
            "Listener detached"
        );

        if state.is_unattended() {
            self.arm_idle_timer_locked(&mut state);
        }
    }

    /// Arm the idle timer if the session currently has no listeners
    pub fn arm_idle_timer(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.is_unattended() {
            self.arm_idle_timer_locked(&mut state);
        }
    }

    fn arm_idle_timer_locked(self: &Arc<Self>, state: &mut MutexGuard<'_, SessionState>) {
        state.cancel_idle_timer();
        let generation = state.idle_generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Dropped outside a runtime; nothing can time the grace window
            if state.finish(SessionPhase::Stopped) {
                state.stop_reason = Some(StopReason::Idle);
                let _ = self.sink.send(SinkEvent::Stopped);
                self.control.kill();
                self.stop.notify_one();
            }
            return;
        };

        let session = Arc::clone(self);
        let grace = self.idle_grace;
        state.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            session.on_idle_deadline(generation);
        }));

        tracing::debug!(
            stream = %self.key,
            session_id = self.id,
            grace_ms = grace.as_millis() as u64,
            "Idle timer armed"
        );
    }

    fn on_idle_deadline(&self, generation: u64) {
        let mut state = self.lock();

        if state.idle_generation != generation {
            return;
        }
        // This task is the timer; dropping its own handle does not abort it
        state.idle_timer = None;

        if !state.is_unattended() {
            return;
        }

        let progress = state.progress;
        if !self.stop_locked(&mut state, StopReason::Idle) {
            return;
        }
        drop(state);

        self.control.kill();
        tracing::info!(
            stream = %self.key,
            session_id = self.id,
            progress = progress,
            "Session stopped after idle timeout"
        );
    }

    /// Kill the pipeline and stop the session
    ///
    /// Safe to call repeatedly and concurrently with completion: only the
    /// first terminal transition wins. Returns whether this call stopped it.
    pub fn force_stop(&self, reason: StopReason) -> bool {
        let mut state = self.lock();
        if !self.stop_locked(&mut state, reason) {
            return false;
        }
        let listeners = state.listener_count;
        drop(state);

        self.control.kill();
        tracing::info!(
            stream = %self.key,
            session_id = self.id,
            reason = ?reason,
            listeners = listeners,
            "Session force-stopped"
        );
        true
    }

    fn stop_locked(&self, state: &mut SessionState, reason: StopReason) -> bool {
        if !state.finish(SessionPhase::Stopped) {
            return false;
        }
        state.stop_reason = Some(reason);
        let _ = self.sink.send(SinkEvent::Stopped);
        self.stop.notify_one();
        true
    }

    /// Wait until the session is force-stopped
    pub async fn stopped(&self) {
        if self.phase() == SessionPhase::Stopped {
            return;
        }
        self.stop.notified().await;
    }

    /// Append a chunk and fan it out. Returns false once the session has ended.
    pub fn push_chunk(&self, data: Bytes) -> bool {
        let mut state = self.lock();
        if state.phase.is_terminal() {
            return false;
        }

        let len = data.len();
        let index = state.append(data.clone());
        // Err only means nobody is attached right now
        let _ = self.sink.send(SinkEvent::Chunk { index, data });

        tracing::trace!(
            stream = %self.key,
            index = index,
            bytes = len,
            "Chunk buffered"
        );
        true
    }

    /// Raise the completion ratio
    pub fn set_progress(&self, progress: f64) {
        self.lock().raise_progress(progress);
    }

    /// Record the extractor's download ratio
    pub fn set_download_ratio(&self, ratio: f64) {
        self.lock().download_ratio = Some(ratio.clamp(0.0, 1.0));
    }

    /// Mark the session completed
    ///
    /// Returns the full output for the cache, or `None` if the session had
    /// already ended (e.g. it was stopped first).
    pub fn complete(&self) -> Option<Bytes> {
        let mut state = self.lock();
        if !state.finish(SessionPhase::Completed) {
            return None;
        }
        state.progress = 1.0;
        let output = state.concat();
        let _ = self.sink.send(SinkEvent::Completed);
        Some(output)
    }

    /// Mark the session failed and tell every attached listener
    ///
    /// Returns false if the session had already ended.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut state = self.lock();
        if !state.finish(SessionPhase::Failed) {
            return false;
        }
        state.failure = Some(reason.clone());
        let _ = self.sink.send(SinkEvent::Failed(reason));
        true
    }

    /// Chunks from `from` onward, used by listeners recovering from lag
    pub(crate) fn chunks_from(&self, from: usize) -> Vec<Bytes> {
        let state = self.lock();
        state.buffer.get(from..).map(<[Bytes]>::to_vec).unwrap_or_default()
    }

    /// Snapshot of the session statistics
    pub fn stats(&self) -> SessionStats {
        let state = self.lock();
        SessionStats {
            session_id: self.id,
            stream_key: self.key.to_string(),
            phase: state.phase,
            listener_count: state.listener_count,
            peak_listeners: state.peak_listeners,
            progress: state.progress,
            download_ratio: state.download_ratio,
            chunks: state.buffer.len(),
            bytes_buffered: state.buffered_bytes,
            age: self.created_at.elapsed(),
        }
    }
}
