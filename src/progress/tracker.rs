//! Transcoder progress tracking
//!
//! ffmpeg run with `-progress pipe:2` writes blocks of `key=value` lines:
//!
//! ```text
//! out_time_us=12345678
//! out_time_ms=12345678
//! out_time=00:00:12.345678
//! progress=continue
//! ```
//!
//! Both `out_time_us` and `out_time_ms` are in microseconds. The classic stats
//! line (`size= 1024kB time=00:00:12.34 bitrate=...`) is understood as well.

use std::time::Duration;

use super::LineBuffer;

/// Converts transcoder diagnostics into a completion ratio in [0, 1]
#[derive(Debug)]
pub struct ProgressTracker {
    total: Duration,
    lines: LineBuffer,
    progress: f64,
    elapsed: Option<Duration>,
    ended: bool,
}

impl ProgressTracker {
    /// Create a tracker for a source of the given total duration
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            lines: LineBuffer::new(),
            progress: 0.0,
            elapsed: None,
            ended: false,
        }
    }

    /// Current ratio
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Last elapsed marker seen
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Whether the end marker was seen
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Total duration of the source
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Feed raw diagnostic text
    ///
    /// Returns the new ratio if it changed.
    pub fn feed(&mut self, text: &str) -> Option<f64> {
        let before = self.progress;
        for line in self.lines.push(text) {
            self.apply_line(&line);
        }
        (self.progress > before).then_some(self.progress)
    }

    /// Interpret any unterminated trailing line
    ///
    /// Returns the new ratio if it changed.
    pub fn finish(&mut self) -> Option<f64> {
        let before = self.progress;
        if let Some(line) = self.lines.flush() {
            self.apply_line(&line);
        }
        (self.progress > before).then_some(self.progress)
    }

    /// Mark the transcode as complete regardless of markers
    pub fn complete(&mut self) {
        self.ended = true;
        self.progress = 1.0;
    }

    fn apply_line(&mut self, line: &str) {
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };

            match key {
                "progress" if value == "end" => self.complete(),
                "out_time_us" | "out_time_ms" => {
                    if let Ok(us) = value.parse::<u64>() {
                        self.observe(Duration::from_micros(us));
                    }
                }
                "out_time" | "time" => {
                    if let Some(elapsed) = parse_timestamp(value) {
                        self.observe(elapsed);
                    }
                }
                _ => {}
            }
        }
    }

    fn observe(&mut self, elapsed: Duration) {
        self.elapsed = Some(elapsed);

        if self.total.is_zero() {
            return;
        }

        let ratio = (elapsed.as_secs_f64() / self.total.as_secs_f64()).clamp(0.0, 1.0);
        if ratio > self.progress {
            self.progress = ratio;
        }
    }
}

/// Parse `HH:MM:SS[.fraction]`, with an optional leading `-`
///
/// Negative timestamps (ffmpeg reports them before the first packet) map to zero.
pub fn parse_timestamp(value: &str) -> Option<Duration> {
    if let Some(rest) = value.strip_prefix('-') {
        return parse_timestamp(rest).map(|_| Duration::ZERO);
    }

    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }

    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    let fraction = Duration::try_from_secs_f64(seconds).ok()?;
    Duration::from_secs(whole).checked_add(fraction)
}
