//! Extractor → transcoder process pair
//!
//! Spawns the extractor (yt-dlp by default) with its stdout connected through
//! an OS pipe to the transcoder's stdin (ffmpeg by default). A supervisor task
//! forwards the transcoder's stdout as output chunks, forwards both stderr
//! streams as diagnostics and reports how the pair ended.
//!
//! ```text
//!   yt-dlp ──stdout──► ffmpeg ──stdout──► Output(Bytes)
//!     │                  │
//!     └──stderr──┐       └──stderr (incl. -progress)──┐
//!                ▼                                    ▼
//!        Diagnostic{Extractor}               Diagnostic{Transcoder}
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::registry::StreamKey;

use super::{
    AudioFormat, DiagnosticSource, KillSwitch, Pipeline, PipelineControl, PipelineEvent,
    PipelineExit, PipelineRequest, PipelineSpawner,
};

/// Bytes of stderr kept per process for failure reports
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Process pair configuration
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Extractor executable
    pub extractor_path: PathBuf,

    /// Transcoder executable
    pub transcoder_path: PathBuf,

    /// Extractor arguments; the source is always appended last
    pub extractor_args: Vec<String>,

    /// Replaces the generated transcoder arguments when set
    pub transcoder_args: Option<Vec<String>>,

    /// Read size for transcoder output
    pub read_chunk_size: usize,

    /// Capacity of the pipeline event channel
    pub event_capacity: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            extractor_path: PathBuf::from("yt-dlp"),
            transcoder_path: PathBuf::from("ffmpeg"),
            extractor_args: [
                "-f",
                "bestaudio[ext=webm]/bestaudio",
                "-o",
                "-",
                "--no-warnings",
                "--progress",
                "--newline",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            transcoder_args: None,
            read_chunk_size: 16 * 1024,
            event_capacity: 64,
        }
    }
}

impl ProcessConfig {
    /// Set the extractor executable
    pub fn extractor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extractor_path = path.into();
        self
    }

    /// Set the transcoder executable
    pub fn transcoder_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcoder_path = path.into();
        self
    }

    /// Replace the extractor arguments
    pub fn extractor_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extractor_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the generated transcoder arguments
    pub fn transcoder_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transcoder_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Set the output read size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(512);
        self
    }

    /// Full extractor argument list for a source
    pub fn extractor_command_args(&self, source: &str) -> Vec<String> {
        let mut args = self.extractor_args.clone();
        args.push(source.to_string());
        args
    }

    /// Full transcoder argument list for a format
    pub fn transcoder_command_args(&self, format: AudioFormat) -> Vec<String> {
        if let Some(ref args) = self.transcoder_args {
            return args.clone();
        }

        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostats",
            "-progress",
            "pipe:2",
            "-fflags",
            "+genpts",
            "-i",
            "pipe:0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.extend(format.transcoder_args().iter().map(|s| s.to_string()));
        if format.needs_fragmented_mp4() {
            args.push("-movflags".to_string());
            args.push("frag_keyframe+empty_moov".to_string());
        }
        args.push("-f".to_string());
        args.push(format.muxer().to_string());
        args.push("pipe:1".to_string());
        args
    }
}

/// Spawns real extractor/transcoder processes
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    config: ProcessConfig,
}

impl ProcessSpawner {
    /// Create a spawner with the given configuration
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

struct ProcessControl {
    kill: Arc<KillSwitch>,
}

impl PipelineControl for ProcessControl {
    fn kill(&self) {
        self.kill.fire();
    }
}

fn spawn_error(path: &std::path::Path, source: std::io::Error) -> Error {
    Error::Spawn {
        program: path.display().to_string(),
        source,
    }
}

impl PipelineSpawner for ProcessSpawner {
    fn spawn(&self, request: &PipelineRequest) -> Result<Pipeline> {
        let config = &self.config;

        let mut extractor = Command::new(&config.extractor_path)
            .args(config.extractor_command_args(&request.source))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&config.extractor_path, e))?;

        let piped: Stdio = match extractor.stdout.take() {
            Some(stdout) => match stdout.try_into() {
                Ok(stdio) => stdio,
                Err(e) => {
                    let _ = extractor.start_kill();
                    return Err(spawn_error(&config.extractor_path, e));
                }
            },
            None => {
                let _ = extractor.start_kill();
                return Err(spawn_error(
                    &config.extractor_path,
                    std::io::Error::other("extractor stdout was not captured"),
                ));
            }
        };

        let mut transcoder = match Command::new(&config.transcoder_path)
            .args(config.transcoder_command_args(request.key.format))
            .stdin(piped)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let _ = extractor.start_kill();
                return Err(spawn_error(&config.transcoder_path, e));
            }
        };

        let (tx, events) = mpsc::channel(config.event_capacity.max(1));
        let kill = Arc::new(KillSwitch::new());

        // Both pipes were configured above, so take() only fails on a broken runtime
        let (Some(output), Some(transcoder_err), Some(extractor_err)) = (
            transcoder.stdout.take(),
            transcoder.stderr.take(),
            extractor.stderr.take(),
        ) else {
            let _ = extractor.start_kill();
            let _ = transcoder.start_kill();
            return Err(spawn_error(
                &config.transcoder_path,
                std::io::Error::other("process pipes were not captured"),
            ));
        };

        let readers = Readers {
            output: tokio::spawn(forward_output(
                output,
                config.read_chunk_size,
                tx.clone(),
                Arc::clone(&kill),
            )),
            extractor_err: tokio::spawn(forward_diagnostics(
                extractor_err,
                DiagnosticSource::Extractor,
                tx.clone(),
            )),
            transcoder_err: tokio::spawn(forward_diagnostics(
                transcoder_err,
                DiagnosticSource::Transcoder,
                tx.clone(),
            )),
        };

        tracing::debug!(
            stream = %request.key,
            extractor = %config.extractor_path.display(),
            transcoder = %config.transcoder_path.display(),
            "Pipeline spawned"
        );

        tokio::spawn(supervise(
            request.key.clone(),
            extractor,
            transcoder,
            readers,
            Arc::clone(&kill),
            tx,
        ));

        Ok(Pipeline {
            events,
            control: Box::new(ProcessControl { kill }),
        })
    }
}

struct Readers {
    output: JoinHandle<()>,
    extractor_err: JoinHandle<String>,
    transcoder_err: JoinHandle<String>,
}

async fn forward_output<R: AsyncRead + Unpin>(
    mut reader: R,
    chunk_size: usize,
    tx: mpsc::Sender<PipelineEvent>,
    kill: Arc<KillSwitch>,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);

    loop {
        buf.reserve(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if tx.send(PipelineEvent::Output(chunk)).await.is_err() {
                    // Nobody consumes the output anymore
                    kill.fire();
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Transcoder stdout read failed");
                break;
            }
        }
    }
}

async fn forward_diagnostics<R: AsyncRead + Unpin>(
    mut reader: R,
    source: DiagnosticSource,
    tx: mpsc::Sender<PipelineEvent>,
) -> String {
    let mut tail = String::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        push_tail(&mut tail, &text);

        // Keep draining even without a consumer so the process never blocks on stderr
        let _ = tx.send(PipelineEvent::Diagnostic { source, text }).await;
    }

    tail
}

fn push_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Whether a line is part of a `-progress` block rather than an error message
fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, value)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !value.contains(' ')
        }
        None => false,
    }
}

fn failure_detail(tail: &str) -> String {
    tail.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_progress_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn wait_or_kill(child: &mut Child, kill: &KillSwitch) -> Option<std::io::Result<ExitStatus>> {
    tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.fired() => None,
    }
}

async fn supervise(
    key: StreamKey,
    mut extractor: Child,
    mut transcoder: Child,
    readers: Readers,
    kill: Arc<KillSwitch>,
    tx: mpsc::Sender<PipelineEvent>,
) {
    let transcoder_status = wait_or_kill(&mut transcoder, &kill).await;

    // A failed transcoder leaves the extractor writing into a dead pipe
    if !matches!(transcoder_status, Some(Ok(status)) if status.success()) {
        let _ = extractor.start_kill();
    }

    let extractor_status = match transcoder_status {
        Some(_) => wait_or_kill(&mut extractor, &kill).await,
        None => None,
    };

    if kill.is_fired() {
        let _ = extractor.start_kill();
        let _ = transcoder.start_kill();
        let _ = extractor.wait().await;
        let _ = transcoder.wait().await;
        readers.output.abort();
        readers.extractor_err.abort();
        readers.transcoder_err.abort();

        tracing::debug!(stream = %key, "Pipeline killed");
        let _ = tx.send(PipelineEvent::Exited(PipelineExit::Killed)).await;
        return;
    }

    // All output must be forwarded before the exit is reported
    let _ = readers.output.await;
    let transcoder_tail = readers.transcoder_err.await.unwrap_or_default();
    let extractor_tail = readers.extractor_err.await.unwrap_or_default();

    let exit = classify(
        transcoder_status,
        extractor_status,
        &transcoder_tail,
        &extractor_tail,
    );

    tracing::debug!(stream = %key, exit = ?exit, "Pipeline exited");
    let _ = tx.send(PipelineEvent::Exited(exit)).await;
}

fn classify(
    transcoder: Option<std::io::Result<ExitStatus>>,
    extractor: Option<std::io::Result<ExitStatus>>,
    transcoder_tail: &str,
    extractor_tail: &str,
) -> PipelineExit {
    let stages = [
        (DiagnosticSource::Transcoder, transcoder, transcoder_tail),
        (DiagnosticSource::Extractor, extractor, extractor_tail),
    ];

    for (stage, status, tail) in stages {
        match status {
            Some(Ok(status)) if status.success() => {}
            Some(Ok(status)) => {
                return PipelineExit::Failed {
                    stage,
                    code: status.code(),
                    detail: failure_detail(tail),
                }
            }
            Some(Err(e)) => {
                return PipelineExit::Failed {
                    stage,
                    code: None,
                    detail: e.to_string(),
                }
            }
            None => return PipelineExit::Killed,
        }
    }

    PipelineExit::Success
}
