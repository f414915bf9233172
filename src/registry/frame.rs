//! Stream keys and the events fanned out to listeners
//!
//! A [`SinkEvent`] carries the chunk index alongside the data so a listener
//! can tell replayed chunks from live ones and recover after lagging.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pipeline::AudioFormat;

/// Unique identifier for a stream (source id + target format)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Source identifier (e.g., a video id)
    pub id: String,
    /// Target audio format
    pub format: AudioFormat,
}

impl StreamKey {
    /// Create a new stream key
    ///
    /// The id must be non-empty and free of whitespace and path separators.
    pub fn new(id: impl Into<String>, format: AudioFormat) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && !id
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\');

        if !valid {
            return Err(Error::InvalidKey(id));
        }

        Ok(Self { id, format })
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.format)
    }
}

/// Event written to a session's live sink
///
/// Cheap to clone: chunk data is reference counted.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Output chunk with its position in the session buffer
    Chunk {
        /// Zero-based index in the session buffer
        index: usize,
        /// Chunk data
        data: Bytes,
    },
    /// The pipeline finished successfully
    Completed,
    /// The pipeline failed after output began
    Failed(String),
    /// The session was stopped on purpose
    Stopped,
}
