//! Encoder diagnostic stream parsing.
//!
//! The encoder prints an input summary containing `Duration: HH:MM:SS.xx` and then
//! carriage-return separated status lines carrying `time=HH:MM:SS.xx`.

/// Tracks encoded time against the expected total.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total_ms: Option<u64>,
    hint_ms: Option<u64>,
    elapsed_ms: u64,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that falls back to `hint_ms` when the stream never reports a duration.
    pub fn with_duration_hint(hint_ms: u64) -> Self {
        Self {
            hint_ms: (hint_ms > 0).then_some(hint_ms),
            ..Self::default()
        }
    }

    /// Consume one line. Returns the completed fraction (0.0-1.0) when the line
    /// advanced the encoded time.
    pub fn feed_line(&mut self, line: &str) -> Option<f64> {
        if self.total_ms.is_none() {
            if let Some(total) = marker_value(line, "Duration:").and_then(parse_timestamp) {
                if total > 0 {
                    self.total_ms = Some(total);
                }
            }
        }

        let time = marker_value(line, "time=").and_then(parse_timestamp)?;
        if time < self.elapsed_ms {
            return None;
        }
        self.elapsed_ms = time;
        self.fraction()
    }

    /// Duration the fraction is measured against.
    pub fn total_ms(&self) -> Option<u64> {
        self.total_ms.or(self.hint_ms)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn fraction(&self) -> Option<f64> {
        let total = self.total_ms()?;
        Some((self.elapsed_ms as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Token following `marker`, trimmed of the separators ffmpeg places after it.
fn marker_value<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    let start = line.find(marker)? + marker.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c == ',' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse `HH:MM:SS(.frac)` into milliseconds. `N/A`, negative and out of range values
/// yield `None`.
pub fn parse_timestamp(value: &str) -> Option<u64> {
    let mut parts = value.trim().split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let fraction_ms = (seconds * 1000.0).round();
    if fraction_ms >= u64::MAX as f64 {
        return None;
    }
    hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_mul(1000)?
        .checked_add(fraction_ms as u64)
}

/// Splits a byte stream into lines on `\n` or `\r`.
#[derive(Debug, Default)]
pub struct DiagnosticLines {
    pending: Vec<u8>,
}

impl DiagnosticLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes. Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Whatever is left after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
