//! Progress parsing for pipeline diagnostics
//!
//! Diagnostics arrive as raw text chunks that do not respect line boundaries.
//! [`LineBuffer`] reassembles lines; [`ProgressTracker`] turns transcoder
//! `-progress` output into a completion ratio and [`DownloadProgress`] parses
//! the extractor's download lines.

pub mod download;
pub mod tracker;

pub use download::DownloadProgress;
pub use tracker::ProgressTracker;

/// Reassembles complete lines from arbitrarily split text
///
/// Both `\n` and `\r` terminate a line, so `\r\n` yields an empty line that
/// callers are expected to skip.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text and return every line it completed
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();

        for ch in text.chars() {
            if ch == '\n' || ch == '\r' {
                lines.push(std::mem::take(&mut self.pending));
            } else {
                self.pending.push(ch);
            }
        }

        lines
    }

    /// Return the unterminated remainder, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Bytes waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
