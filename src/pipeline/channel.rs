//! In-process pipeline driven through channels
//!
//! [`ChannelSpawner`] implements [`PipelineSpawner`] without any processes:
//! each spawn hands a [`PipelineFeed`] to the owner, who then plays the part
//! of the process pair. Useful for embedding other producers and for tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::{
    DiagnosticSource, KillSwitch, Pipeline, PipelineControl, PipelineEvent, PipelineExit,
    PipelineRequest, PipelineSpawner,
};

/// Producer side of a channel pipeline
pub struct PipelineFeed {
    request: PipelineRequest,
    tx: mpsc::Sender<PipelineEvent>,
    kill: Arc<KillSwitch>,
}

impl PipelineFeed {
    /// Request this pipeline was spawned for
    pub fn request(&self) -> &PipelineRequest {
        &self.request
    }

    /// Emit an output chunk. Returns false once the consumer is gone.
    pub async fn output(&self, data: impl Into<Bytes>) -> bool {
        self.send(PipelineEvent::Output(data.into())).await
    }

    /// Emit diagnostic text
    pub async fn diagnostic(&self, source: DiagnosticSource, text: impl Into<String>) -> bool {
        self.send(PipelineEvent::Diagnostic {
            source,
            text: text.into(),
        })
        .await
    }

    /// End the pipeline with the given exit, consuming the feed
    pub async fn exit(self, exit: PipelineExit) -> bool {
        self.send(PipelineEvent::Exited(exit)).await
    }

    /// Whether the consumer asked for the pipeline to be killed
    pub fn is_killed(&self) -> bool {
        self.kill.is_fired()
    }

    /// Wait until the pipeline is killed
    pub async fn killed(&self) {
        self.kill.fired().await
    }

    async fn send(&self, event: PipelineEvent) -> bool {
        if self.kill.is_fired() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }
}

struct ChannelControl {
    kill: Arc<KillSwitch>,
}

impl PipelineControl for ChannelControl {
    fn kill(&self) {
        self.kill.fire();
    }
}

/// Spawner that forwards each new pipeline to a feed receiver
pub struct ChannelSpawner {
    feeds: mpsc::UnboundedSender<PipelineFeed>,
    capacity: usize,
    spawned: AtomicUsize,
    fail_next: AtomicBool,
}

impl ChannelSpawner {
    /// Create a spawner and the receiver for its feeds
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<PipelineFeed>) {
        let (feeds, rx) = mpsc::unbounded_channel();
        let spawner = Self {
            feeds,
            capacity: capacity.max(1),
            spawned: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        };
        (spawner, rx)
    }

    /// Number of pipelines spawned so far
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Make the next spawn fail as if the program were missing
    pub fn fail_next_spawn(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl PipelineSpawner for ChannelSpawner {
    fn spawn(&self, request: &PipelineRequest) -> Result<Pipeline> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Spawn {
                program: "channel".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "spawn refused"),
            });
        }

        let (tx, events) = mpsc::channel(self.capacity);
        let kill = Arc::new(KillSwitch::new());
        let feed = PipelineFeed {
            request: request.clone(),
            tx,
            kill: Arc::clone(&kill),
        };

        self.feeds.send(feed).map_err(|_| Error::Spawn {
            program: "channel".to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "feed receiver dropped"),
        })?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        Ok(Pipeline {
            events,
            control: Box::new(ChannelControl { kill }),
        })
    }
}
