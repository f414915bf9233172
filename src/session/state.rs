//! Session state machine
//!
//! Tracks a session from pipeline start to one of its terminal phases.
//! Only a running session can change phase, and only once:
//!
//! ```text
//!             ┌──► Completed   (pipeline exited cleanly)
//!   Running ──┼──► Failed      (pipeline exited abnormally)
//!             └──► Stopped     (killed: idle timeout or shutdown)
//! ```

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Pipeline running, output being produced
    Running,
    /// Pipeline finished, output promoted to the cache
    Completed,
    /// Pipeline exited abnormally
    Failed,
    /// Pipeline killed on purpose
    Stopped,
}

impl SessionPhase {
    /// Whether the phase is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionPhase::Running)
    }
}

/// Why a session was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No listener came back within the grace window
    Idle,
    /// Broadcaster shutdown
    Shutdown,
    /// Stopped by the owner or the pipeline reported a kill it did not request
    External,
}

/// Mutable per-session state, guarded by the session lock
#[derive(Debug)]
pub(crate) struct SessionState {
    /// Chunks produced so far, in order
    pub buffer: Vec<Bytes>,

    /// Sum of chunk sizes in `buffer`
    pub buffered_bytes: usize,

    /// Transcode completion ratio in [0, 1]
    pub progress: f64,

    /// Extractor download ratio, if the extractor reports one
    pub download_ratio: Option<f64>,

    /// Attached listeners
    pub listener_count: usize,

    /// Highest listener count seen
    pub peak_listeners: usize,

    /// Current phase
    pub phase: SessionPhase,

    /// Failure reason once failed
    pub failure: Option<String>,

    /// Reason once stopped
    pub stop_reason: Option<StopReason>,

    /// Pending idle timer
    pub idle_timer: Option<JoinHandle<()>>,

    /// Bumped whenever the idle timer is armed or cancelled
    pub idle_generation: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            buffered_bytes: 0,
            progress: 0.0,
            download_ratio: None,
            listener_count: 0,
            peak_listeners: 0,
            phase: SessionPhase::Running,
            failure: None,
            stop_reason: None,
            idle_timer: None,
            idle_generation: 0,
        }
    }

    /// Append a chunk, returning its index
    pub fn append(&mut self, data: Bytes) -> usize {
        let index = self.buffer.len();
        self.buffered_bytes += data.len();
        self.buffer.push(data);
        index
    }

    /// Raise progress; never lowers it
    pub fn raise_progress(&mut self, progress: f64) -> bool {
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
            true
        } else {
            false
        }
    }

    pub fn add_listener(&mut self) {
        self.listener_count += 1;
        self.peak_listeners = self.peak_listeners.max(self.listener_count);
    }

    /// Remove a listener, floored at zero. Returns the remaining count.
    pub fn remove_listener(&mut self) -> usize {
        self.listener_count = self.listener_count.saturating_sub(1);
        self.listener_count
    }

    /// Whether the idle teardown rule applies right now
    pub fn is_unattended(&self) -> bool {
        self.phase == SessionPhase::Running && self.listener_count == 0 && self.progress < 1.0
    }

    /// Cancel any pending idle timer
    pub fn cancel_idle_timer(&mut self) {
        self.idle_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    /// Move from `Running` to a terminal phase. Returns false if already terminal.
    pub fn finish(&mut self, phase: SessionPhase) -> bool {
        if self.phase.is_terminal() || !phase.is_terminal() {
            return false;
        }
        self.phase = phase;
        self.cancel_idle_timer();
        true
    }

    /// Contiguous copy of everything produced
    pub fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.buffered_bytes);
        for chunk in &self.buffer {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}
