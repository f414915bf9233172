//! Extractor download progress
//!
//! yt-dlp run with `--progress --newline` reports lines such as:
//!
//! ```text
//! [download]   6.1% of 3.42MiB at 1.12MiB/s ETA 00:03
//! [download] 100% in 00:00:55
//! ```

/// One parsed `[download]` line
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    /// Percentage downloaded, 0–100
    pub percent: f64,
    /// Total size as printed (e.g. `3.42MiB`)
    pub total_size: Option<String>,
    /// Transfer speed as printed (e.g. `1.12MiB/s`)
    pub speed: Option<String>,
    /// Remaining time in seconds, if known
    pub eta_secs: Option<u64>,
    /// Elapsed time as printed on the final summary line
    pub elapsed: Option<String>,
}

impl DownloadProgress {
    /// Parse a single line; returns `None` for anything that is not a progress line
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("[download]")?;
        let mut tokens = rest.split_whitespace();

        let percent: f64 = tokens.next()?.strip_suffix('%')?.parse().ok()?;
        if !percent.is_finite() {
            return None;
        }

        let mut progress = Self {
            percent,
            total_size: None,
            speed: None,
            eta_secs: None,
            elapsed: None,
        };

        match tokens.next()? {
            "of" => {
                progress.total_size = Some(tokens.next()?.trim_start_matches('~').to_string());
                while let Some(token) = tokens.next() {
                    match token {
                        "at" => progress.speed = tokens.next().map(str::to_string),
                        "ETA" => progress.eta_secs = tokens.next().and_then(parse_eta),
                        _ => {}
                    }
                }
            }
            "in" => {
                progress.elapsed = tokens.next().map(str::to_string);
                progress.eta_secs = Some(0);
            }
            _ => return None,
        }

        Some(progress)
    }

    /// Percentage as a ratio in [0, 1]
    pub fn ratio(&self) -> f64 {
        (self.percent / 100.0).clamp(0.0, 1.0)
    }
}

/// Parse `MM:SS`, `HH:MM:SS` or `DD:HH:MM:SS`
fn parse_eta(value: &str) -> Option<u64> {
    let parts = value
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;

    let units: &[u64] = match parts.len() {
        2 => &[60, 1],
        3 => &[3600, 60, 1],
        4 => &[86_400, 3600, 60, 1],
        _ => return None,
    };

    parts
        .iter()
        .zip(units)
        .try_fold(0u64, |total, (part, unit)| total.checked_add(part.checked_mul(*unit)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let p = DownloadProgress::parse("[download]   6.1% of 3.42MiB at 1.12MiB/s ETA 00:03")
            .unwrap();

        assert_eq!(p.percent, 6.1);
        assert_eq!(p.total_size.as_deref(), Some("3.42MiB"));
        assert_eq!(p.speed.as_deref(), Some("1.12MiB/s"));
        assert_eq!(p.eta_secs, Some(3));
        assert!(p.elapsed.is_none());
    }

    #[test]
    fn test_parse_summary_line() {
        let p = DownloadProgress::parse("[download] 100% in 00:00:55").unwrap();

        assert_eq!(p.ratio(), 1.0);
        assert_eq!(p.elapsed.as_deref(), Some("00:00:55"));
        assert_eq!(p.eta_secs, Some(0));
    }

    #[test]
    fn test_unknown_eta_and_estimated_size() {
        let p = DownloadProgress::parse("[download]  42.0% of ~10.00MiB at  Unknown B/s ETA Unknown")
            .unwrap();

        assert_eq!(p.total_size.as_deref(), Some("10.00MiB"));
        assert_eq!(p.eta_secs, None);
        assert_eq!(p.ratio(), 0.42);
    }

    #[test]
    fn test_long_eta() {
        assert_eq!(parse_eta("1:02:03"), Some(3723));
        assert_eq!(parse_eta("1:00:00:01"), Some(86_401));
        assert_eq!(parse_eta("UNKNOWN"), None);
    }

    #[test]
    fn test_oversized_eta_is_unknown() {
        assert_eq!(parse_eta("18446744073709551615:00"), None);
        assert_eq!(parse_eta("99999999999999999:00:00:00"), None);

        let p = DownloadProgress::parse(
            "[download]  10.0% of 3.42MiB at 1.00KiB/s ETA 9999999999999999999:00:00",
        )
        .unwrap();
        assert_eq!(p.eta_secs, None);
        assert_eq!(p.ratio(), 0.1);
    }

    #[test]
    fn test_non_progress_lines() {
        assert!(DownloadProgress::parse("[youtube] abc: Downloading webpage").is_none());
        assert!(DownloadProgress::parse("[download] Destination: -").is_none());
        assert!(DownloadProgress::parse("").is_none());
    }
}
