//! Per-session driver task
//!
//! Consumes pipeline events and applies them to the session: output chunks
//! are fanned out, diagnostics feed the progress trackers. When the pipeline
//! ends (or the session is force-stopped) the driver settles the outcome and
//! deregisters the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::cache::CompletedCache;
use crate::pipeline::{DiagnosticSource, PipelineEvent, PipelineExit};
use crate::progress::{DownloadProgress, LineBuffer, ProgressTracker};
use crate::registry::SessionRegistry;
use crate::stats::Counters;

use super::entry::Session;
use super::state::StopReason;

/// Shared services a driver reports into
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub registry: Arc<SessionRegistry>,
    pub cache: Arc<CompletedCache>,
    pub counters: Arc<Counters>,
}

enum Outcome {
    Exited(PipelineExit),
    /// Event stream ended without an exit status
    Closed,
    /// Session was force-stopped
    Stopped,
}

pub(crate) struct Driver {
    session: Arc<Session>,
    events: mpsc::Receiver<PipelineEvent>,
    tracker: ProgressTracker,
    extractor_lines: LineBuffer,
    cache_ttl: Duration,
    context: DriverContext,
    /// Resolves once the session is visible in the registry
    registered: oneshot::Receiver<()>,
}

impl Driver {
    pub fn new(
        session: Arc<Session>,
        events: mpsc::Receiver<PipelineEvent>,
        duration: Duration,
        cache_ttl: Duration,
        context: DriverContext,
        registered: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            session,
            events,
            tracker: ProgressTracker::new(duration),
            extractor_lines: LineBuffer::new(),
            cache_ttl,
            context,
            registered,
        }
    }

    pub async fn run(mut self) {
        let outcome = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(PipelineEvent::Output(data)) => {
                        self.session.push_chunk(data);
                    }
                    Some(PipelineEvent::Diagnostic { source, text }) => {
                        self.on_diagnostic(source, &text);
                    }
                    Some(PipelineEvent::Exited(exit)) => break Outcome::Exited(exit),
                    None => break Outcome::Closed,
                },
                _ = self.session.stopped() => break Outcome::Stopped,
            }
        };

        self.settle(outcome);

        // Sender dropped means the creator gave up; deregister all the same
        let _ = (&mut self.registered).await;
        self.context
            .registry
            .remove_session(self.session.key(), self.session.id())
            .await;
    }

    fn on_diagnostic(&mut self, source: DiagnosticSource, text: &str) {
        match source {
            DiagnosticSource::Transcoder => {
                if let Some(progress) = self.tracker.feed(text) {
                    self.session.set_progress(progress);
                }
            }
            DiagnosticSource::Extractor => {
                for line in self.extractor_lines.push(text) {
                    if let Some(download) = DownloadProgress::parse(&line) {
                        self.session.set_download_ratio(download.ratio());
                    } else if !line.is_empty() {
                        tracing::trace!(stream = %self.session.key(), line = %line, "Extractor");
                    }
                }
            }
        }
    }

    fn settle(&mut self, outcome: Outcome) {
        let key = self.session.key().clone();
        let session_id = self.session.id();

        match outcome {
            Outcome::Exited(PipelineExit::Success) => {
                if let Some(progress) = self.tracker.finish() {
                    self.session.set_progress(progress);
                }
                self.tracker.complete();

                let Some(output) = self.session.complete() else {
                    tracing::debug!(stream = %key, session_id = session_id, "Completion after stop ignored");
                    return;
                };

                let bytes = output.len();
                self.context.cache.insert(key.clone(), output, self.cache_ttl);
                self.context.counters.record_completed();

                tracing::info!(
                    stream = %key,
                    session_id = session_id,
                    bytes = bytes,
                    "Session completed"
                );
            }
            Outcome::Exited(exit @ PipelineExit::Failed { .. }) => {
                self.fail(exit.reason());
            }
            Outcome::Closed => {
                self.fail("pipeline closed without exit status".to_string());
            }
            Outcome::Exited(PipelineExit::Killed) | Outcome::Stopped => {
                // No-op if the session already stopped itself
                self.session.force_stop(StopReason::External);

                if self.session.stop_reason() == Some(StopReason::Idle) {
                    self.context.counters.record_idle_teardown();
                }

                tracing::info!(
                    stream = %key,
                    session_id = session_id,
                    reason = ?self.session.stop_reason(),
                    progress = self.session.progress(),
                    "Session torn down"
                );
            }
        }
    }

    fn fail(&self, reason: String) {
        if !self.session.fail(reason.clone()) {
            return;
        }
        self.context.counters.record_failed();

        tracing::warn!(
            stream = %self.session.key(),
            session_id = self.session.id(),
            listeners = self.session.listener_count(),
            reason = %reason,
            "Pipeline failed"
        );
    }
}
