//! Error types
//!
//! One error type covers the whole broadcaster. Variants follow the order in
//! which a request can fail: admission, spawn, mid-stream.

use std::io;

use crate::registry::StreamKey;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broadcaster operations
#[derive(Debug)]
pub enum Error {
    /// Stream identifier rejected before any session was created
    InvalidKey(String),
    /// Metadata lookup for a new session failed
    Metadata(String),
    /// A pipeline process could not be started
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying I/O error
        source: io::Error,
    },
    /// The pipeline exited abnormally after output began
    PipelineFailed {
        /// Stream the failure belongs to
        key: StreamKey,
        /// Exit details reported by the pipeline
        reason: String,
    },
    /// The session was torn down before the listener could attach
    SessionClosed(StreamKey),
}

impl Error {
    /// Whether the error was raised before any session existed for the request
    pub fn is_admission(&self) -> bool {
        matches!(self, Error::InvalidKey(_) | Error::Metadata(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidKey(id) => write!(f, "Invalid stream id: {:?}", id),
            Error::Metadata(msg) => write!(f, "Metadata lookup failed: {}", msg),
            Error::Spawn { program, source } => {
                write!(f, "Failed to spawn {}: {}", program, source)
            }
            Error::PipelineFailed { key, reason } => {
                write!(f, "Pipeline failed for {}: {}", key, reason)
            }
            Error::SessionClosed(key) => write!(f, "Session closed: {}", key),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AudioFormat;

    #[test]
    fn test_admission_classification() {
        assert!(Error::InvalidKey(String::new()).is_admission());
        assert!(Error::Metadata("no such video".into()).is_admission());

        let key = StreamKey::new("abc", AudioFormat::Mp3).unwrap();
        assert!(!Error::SessionClosed(key).is_admission());
    }

    #[test]
    fn test_display() {
        let key = StreamKey::new("abc", AudioFormat::Opus).unwrap();
        let err = Error::PipelineFailed {
            key,
            reason: "ffmpeg exited with code 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Pipeline failed for abc.opus: ffmpeg exited with code 1"
        );

        let err = Error::Spawn {
            program: "yt-dlp".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().starts_with("Failed to spawn yt-dlp"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
