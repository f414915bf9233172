//! Live transcode broadcaster
//!
//! Transcodes a remote audio source to a target format in real time and
//! shares each in-flight transcode among every listener asking for it:
//!
//! - One pipeline (extractor piped into a transcoder) per stream key
//! - Late joiners replay everything produced so far, then follow live output
//! - Completed output is cached for a while and served without respawning
//! - A session left without listeners is killed after a short grace window
//!
//! # Example
//!
//! ```no_run
//! use live_transcode::{
//!     AudioFormat, BroadcastConfig, Broadcaster, FixedDuration, ProcessConfig, ProcessSpawner,
//!     StreamKey, StreamRequest,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> live_transcode::Result<()> {
//! let broadcaster = Broadcaster::new(
//!     BroadcastConfig::default(),
//!     ProcessSpawner::new(ProcessConfig::default()),
//!     FixedDuration(Duration::from_secs(240)),
//! );
//!
//! let key = StreamKey::new("dQw4w9WgXcQ", AudioFormat::Opus)?;
//! let mut handle = broadcaster
//!     .request(StreamRequest::new(key, "https://www.youtube.com/watch?v=dQw4w9WgXcQ"))
//!     .await?;
//!
//! while let Some(chunk) = handle.recv().await? {
//!     println!("{} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod cache;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod session;
pub mod stats;

pub use broadcast::{BroadcastConfig, Broadcaster, FixedDuration, MetadataLookup, StreamRequest};
pub use cache::{CachePolicy, CompletedCache};
pub use error::{Error, Result};
pub use pipeline::{
    AudioFormat, ChannelSpawner, PipelineFeed, PipelineSpawner, ProcessConfig, ProcessSpawner,
};
pub use registry::{SessionRegistry, StreamKey};
pub use session::{ListenerHandle, SessionPhase};
pub use stats::{BroadcastStats, SessionStats};
