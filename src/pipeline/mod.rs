//! Pipeline process pair
//!
//! A pipeline is an extractor whose stdout feeds a transcoder. The broadcaster
//! treats it as an opaque byte producer reached through [`PipelineSpawner`]:
//!
//! ```text
//!   spawn(request) ──► Pipeline {
//!                        events:  mpsc::Receiver<PipelineEvent>,
//!                        control: Box<dyn PipelineControl>,  // kill()
//!                      }
//!
//!   events: Output(Bytes)* ... Diagnostic{..}* ... Exited(PipelineExit)
//! ```
//!
//! Output and diagnostics may interleave arbitrarily; `Exited` is always last
//! and is only sent once every output chunk has been delivered.

pub mod channel;
pub mod format;
pub mod process;

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::Result;
use crate::registry::StreamKey;

pub use channel::{ChannelSpawner, PipelineFeed};
pub use format::AudioFormat;
pub use process::{ProcessConfig, ProcessSpawner};

/// What to run for a new session
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Stream the pipeline produces
    pub key: StreamKey,
    /// Source handed to the extractor (usually a URL)
    pub source: String,
}

/// Which process emitted a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    /// The extraction process (yt-dlp)
    Extractor,
    /// The transcode process (ffmpeg)
    Transcoder,
}

impl std::fmt::Display for DiagnosticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticSource::Extractor => f.write_str("extractor"),
            DiagnosticSource::Transcoder => f.write_str("transcoder"),
        }
    }
}

/// How a pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// Both processes exited cleanly
    Success,
    /// A process exited abnormally
    Failed {
        /// Process that failed
        stage: DiagnosticSource,
        /// Exit code, if the process was not killed by a signal
        code: Option<i32>,
        /// Tail of the process diagnostics
        detail: String,
    },
    /// The pipeline was killed through [`PipelineControl::kill`]
    Killed,
}

impl PipelineExit {
    /// Human readable failure reason
    pub fn reason(&self) -> String {
        match self {
            PipelineExit::Success => "success".to_string(),
            PipelineExit::Killed => "killed".to_string(),
            PipelineExit::Failed {
                stage,
                code,
                detail,
            } => {
                let mut reason = match code {
                    Some(code) => format!("{} exited with code {}", stage, code),
                    None => format!("{} terminated by signal", stage),
                };
                let detail = detail.trim();
                if !detail.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(detail);
                }
                reason
            }
        }
    }
}

/// Event produced by a running pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Chunk of transcoded output
    Output(Bytes),
    /// Raw diagnostic text, not line aligned
    Diagnostic {
        /// Emitting process
        source: DiagnosticSource,
        /// Text as read from the process
        text: String,
    },
    /// The pipeline ended; always the last event
    Exited(PipelineExit),
}

/// Handle used to tear a pipeline down
pub trait PipelineControl: Send + Sync {
    /// Hard-kill both processes. Calling this more than once is a no-op.
    fn kill(&self);
}

/// A started pipeline
pub struct Pipeline {
    /// Event stream of the pipeline
    pub events: mpsc::Receiver<PipelineEvent>,
    /// Kill handle
    pub control: Box<dyn PipelineControl>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

/// Starts pipeline process pairs
///
/// `spawn` is called from within a Tokio runtime and may spawn tasks. A
/// returned error means nothing is left running.
pub trait PipelineSpawner: Send + Sync + 'static {
    /// Start a pipeline for the request
    fn spawn(&self, request: &PipelineRequest) -> Result<Pipeline>;
}

/// One-shot kill signal shared between a [`PipelineControl`] and the task
/// supervising the processes
#[derive(Debug, Default)]
pub struct KillSwitch {
    fired: AtomicBool,
    notify: Notify,
}

impl KillSwitch {
    /// Create an unfired switch
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the switch. Returns false if it was already fired.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        // notify_one stores a permit, so a waiter that arrives late still wakes
        self.notify.notify_one();
        true
    }

    /// Whether the switch has been fired
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the switch fires
    pub async fn fired(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}
