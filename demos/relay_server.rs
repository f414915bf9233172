//! HTTP relay for live transcodes
//!
//! Run with: cargo run --example relay_server [BIND_ADDR]
//!
//! Requires `yt-dlp` and `ffmpeg` on the PATH.
//!
//! Examples:
//!   cargo run --example relay_server                    # binds to 0.0.0.0:8080
//!   cargo run --example relay_server 127.0.0.1:9000     # binds to 127.0.0.1:9000
//!
//! ## Listening
//!
//!   curl -o out.opus "http://localhost:8080/stream?id=dQw4w9WgXcQ&format=opus"
//!   ffplay "http://localhost:8080/stream?id=dQw4w9WgXcQ"
//!
//! Pass `duration=<secs>` to skip the metadata lookup.
//!
//! ## Features
//!
//! - Single-flight: concurrent requests for one id and format share one pipeline
//! - Late joiners get everything produced so far, then live output
//! - Finished transcodes are served from memory for a while
//! - `GET /stats` reports broadcaster counters

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::process::Command;

use live_transcode::{
    AudioFormat, BroadcastConfig, Broadcaster, Error, MetadataLookup, ProcessConfig,
    ProcessSpawner, StreamKey, StreamRequest,
};

/// Looks up source durations with `yt-dlp --print duration`
struct YtDlpDuration {
    program: PathBuf,
}

impl MetadataLookup for YtDlpDuration {
    fn duration(
        &self,
        request: &StreamRequest,
    ) -> impl Future<Output = live_transcode::Result<Duration>> + Send {
        let program = self.program.clone();
        let source = request.source.clone();

        async move {
            let output = Command::new(&program)
                .args(["--print", "duration", "--skip-download", "--no-warnings"])
                .arg(&source)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| Error::Metadata(format!("{}: {}", program.display(), e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::Metadata(stderr.trim().to_string()));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let secs: f64 = stdout
                .trim()
                .parse()
                .map_err(|_| Error::Metadata(format!("unexpected duration {:?}", stdout.trim())))?;

            Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::Metadata(format!("unexpected duration {}: {}", secs, e)))
        }
    }
}

type Relay = Broadcaster<ProcessSpawner, YtDlpDuration>;

#[derive(Debug, Deserialize)]
struct StreamParams {
    id: String,
    format: Option<String>,
    duration: Option<f64>,
}

async fn handle_stream(
    State(relay): State<Arc<Relay>>,
    Query(params): Query<StreamParams>,
) -> Response {
    let format = match params.format.as_deref() {
        Some(ext) => match ext.parse::<AudioFormat>() {
            Ok(format) => format,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        None => AudioFormat::default(),
    };

    let key = match StreamKey::new(params.id, format) {
        Ok(key) => key,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let source = format!("https://www.youtube.com/watch?v={}", key.id);
    let mut request = StreamRequest::new(key, source);
    if let Some(secs) = params.duration {
        match Duration::try_from_secs_f64(secs) {
            Ok(duration) if !duration.is_zero() => request = request.duration_hint(duration),
            Ok(_) => {}
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("invalid duration: {}", e)).into_response()
            }
        }
    }

    let handle = match relay.request(request).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Stream request failed");
            let status = match e {
                Error::InvalidKey(_) => StatusCode::BAD_REQUEST,
                Error::Metadata(_) | Error::PipelineFailed { .. } => StatusCode::BAD_GATEWAY,
                Error::SessionClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
                Error::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, e.to_string()).into_response();
        }
    };

    let content_type = handle.content_type();
    let stream = futures::stream::unfold(handle, |mut handle| async move {
        match handle.recv().await {
            Ok(Some(chunk)) => Some((Ok(chunk), handle)),
            Ok(None) => None,
            // The handle reports end of stream on the next call
            Err(e) => Some((Err::<bytes::Bytes, Error>(e), handle)),
        }
    });

    ([(header::CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response()
}

async fn handle_stats(State(relay): State<Arc<Relay>>) -> String {
    let stats = relay.stats().await;
    let mut out = format!(
        "requests: {}\ncache hits: {} ({:.0}%)\njoins: {}\nspawned: {}\ncompleted: {}\nfailed: {}\nidle teardowns: {}\nactive sessions: {}\ncached entries: {}\n",
        stats.requests,
        stats.cache_hits,
        stats.cache_hit_ratio() * 100.0,
        stats.joins,
        stats.sessions_spawned,
        stats.sessions_completed,
        stats.sessions_failed,
        stats.idle_teardowns,
        stats.active_sessions,
        stats.cached_entries,
    );

    for session in relay.registry().sessions().await {
        let s = session.stats();
        out.push_str(&format!(
            "\n[{}] {} {:?} listeners={} progress={:.1}% bytes={} bitrate={}bps",
            s.session_id,
            s.stream_key,
            s.phase,
            s.listener_count,
            s.progress * 100.0,
            s.bytes_buffered,
            s.bitrate(),
        ));
    }
    out
}

fn print_usage() {
    eprintln!("Usage: relay_server [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:8080)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr: SocketAddr = match args.get(1) {
        Some(addr) => match addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: invalid address {:?}: {}", addr, e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => SocketAddr::from(([0, 0, 0, 0], 8080)),
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("live_transcode=debug".parse()?)
                .add_directive("relay_server=debug".parse()?),
        )
        .init();

    let process_config = ProcessConfig::default();
    let metadata = YtDlpDuration {
        program: process_config.extractor_path.clone(),
    };
    let relay = Arc::new(Broadcaster::new(
        BroadcastConfig::default(),
        ProcessSpawner::new(process_config),
        metadata,
    ));

    let app = Router::new()
        .route("/stream", get(handle_stream))
        .route("/stats", get(handle_stats))
        .with_state(Arc::clone(&relay));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("Relay listening on http://{}", bind_addr);
    println!("Try: ffplay \"http://{}/stream?id=dQw4w9WgXcQ&format=mp3\"", bind_addr);

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nShutting down...");
        // Ends every open stream so graceful shutdown can finish
        relay.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
