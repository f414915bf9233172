//! Listener side of a session
//!
//! A [`LiveListener`] drains its replay snapshot first, then follows the
//! session's broadcast sink. Chunk indices keep delivery exact: anything
//! already replayed is skipped and any gap (a lagged receiver) is filled from
//! the session buffer.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::{Error, Result};
use crate::pipeline::AudioFormat;
use crate::registry::{SinkEvent, StreamKey};

use super::entry::Session;

/// A listener attached to a running (or just completed) session
///
/// Detaches from the session once it sees the terminal event, or when dropped.
pub struct LiveListener {
    session: Arc<Session>,
    rx: broadcast::Receiver<SinkEvent>,
    replay: VecDeque<Bytes>,
    /// Index of the next chunk to deliver
    cursor: usize,
    terminal: Option<SinkEvent>,
    done: bool,
    attached: bool,
}

impl std::fmt::Debug for LiveListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveListener")
            .field("session_id", &self.session.id())
            .field("cursor", &self.cursor)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl LiveListener {
    pub(crate) fn new(
        session: Arc<Session>,
        rx: broadcast::Receiver<SinkEvent>,
        replay: Vec<Bytes>,
        terminal: Option<SinkEvent>,
    ) -> Self {
        let cursor = replay.len();
        Self {
            session,
            rx,
            replay: replay.into(),
            cursor,
            terminal,
            done: false,
            attached: true,
        }
    }

    /// Session this listener is attached to
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Next chunk
    ///
    /// `Ok(None)` once the output is complete. A failed pipeline yields
    /// [`Error::PipelineFailed`] and a stopped session [`Error::SessionClosed`];
    /// after either, further calls return `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(chunk) = self.replay.pop_front() {
                return Ok(Some(chunk));
            }

            if self.done {
                return Ok(None);
            }

            if let Some(event) = self.terminal.take() {
                return self.finish(event);
            }

            match self.rx.recv().await {
                Ok(SinkEvent::Chunk { index, data }) => {
                    if index < self.cursor {
                        continue;
                    }
                    if index > self.cursor {
                        // Missed chunks; this one is in the buffer too
                        self.catch_up();
                        continue;
                    }
                    self.cursor = index + 1;
                    return Ok(Some(data));
                }
                Ok(event) => {
                    // Chunks sent before the terminal event may have been lost to lag
                    self.catch_up();
                    self.terminal = Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        stream = %self.session.key(),
                        skipped = skipped,
                        cursor = self.cursor,
                        "Listener lagged, recovering from buffer"
                    );
                    self.catch_up();
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    self.release();
                    return Err(Error::SessionClosed(self.session.key().clone()));
                }
            }
        }
    }

    fn catch_up(&mut self) {
        let missed = self.session.chunks_from(self.cursor);
        self.cursor += missed.len();
        self.replay.extend(missed);
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.attached, false) {
            self.session.detach();
        }
    }

    fn finish(&mut self, event: SinkEvent) -> Result<Option<Bytes>> {
        self.done = true;
        self.release();
        match event {
            SinkEvent::Failed(reason) => Err(Error::PipelineFailed {
                key: self.session.key().clone(),
                reason,
            }),
            SinkEvent::Stopped => Err(Error::SessionClosed(self.session.key().clone())),
            SinkEvent::Completed | SinkEvent::Chunk { .. } => Ok(None),
        }
    }
}

impl Drop for LiveListener {
    fn drop(&mut self) {
        self.release();
    }
}

enum Source {
    Replay(Option<Bytes>),
    Live(LiveListener),
}

/// Handle returned to a requester
///
/// Either a one-shot replay of cached output or a live listener on a session.
/// Dropping the handle (or calling [`cancel`](Self::cancel)) releases it.
pub struct ListenerHandle {
    key: StreamKey,
    source: Source,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("replay", &self.is_replay())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl ListenerHandle {
    pub(crate) fn replay(key: StreamKey, data: Bytes) -> Self {
        Self {
            key,
            source: Source::Replay(Some(data)),
        }
    }

    pub(crate) fn live(key: StreamKey, listener: LiveListener) -> Self {
        Self {
            key,
            source: Source::Live(listener),
        }
    }

    /// Next chunk of output, `Ok(None)` at the end
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        match &mut self.source {
            Source::Replay(data) => Ok(data.take()),
            Source::Live(listener) => listener.recv().await,
        }
    }

    /// Drain the remaining output into one buffer
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut out = bytes::BytesMut::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Stop listening
    pub fn cancel(self) {}

    /// Requested stream
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Output format
    pub fn format(&self) -> AudioFormat {
        self.key.format
    }

    /// MIME type of the output
    pub fn content_type(&self) -> &'static str {
        self.key.format.content_type()
    }

    /// Whether this handle serves cached output
    pub fn is_replay(&self) -> bool {
        matches!(self.source, Source::Replay(_))
    }

    /// Id of the session being followed, if live
    pub fn session_id(&self) -> Option<u64> {
        match &self.source {
            Source::Replay(_) => None,
            Source::Live(listener) => Some(listener.session.id()),
        }
    }
}
