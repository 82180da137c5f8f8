//! Parsing of the copy tool's progress output and the write progress tracker.

use regex::Regex;
use std::sync::OnceLock;

/// Highest percentage reported before the copy tool has exited successfully.
pub const MAX_UNCONFIRMED_PERCENT: f64 = 99.0;

/// What a single line of copy-tool output says about progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    /// `<N> bytes (...) copied, ...`
    Bytes(u64),
    /// `... <N.N>% ...`
    Percent(f64),
    /// Anything else; logged and otherwise ignored.
    Unrecognized,
}

fn bytes_re() -> &'static Regex {
    static BYTES_RE: OnceLock<Regex> = OnceLock::new();
    BYTES_RE.get_or_init(|| Regex::new(r"(\d+) bytes").expect("valid byte count regex"))
}

fn percent_re() -> &'static Regex {
    static PERCENT_RE: OnceLock<Regex> = OnceLock::new();
    PERCENT_RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid percentage regex"))
}

/// Classifies one progress line. The byte-count grammar wins when a line
/// matches both.
pub fn parse_progress_line(line: &str) -> ProgressEvent {
    if line.contains("copied") {
        if let Some(bytes) = bytes_re()
            .captures(line)
            .and_then(|caps| caps[1].parse().ok())
        {
            return ProgressEvent::Bytes(bytes);
        }
    }
    if let Some(percent) = percent_re()
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
    {
        return ProgressEvent::Percent(percent);
    }
    ProgressEvent::Unrecognized
}

/// Progress of one write, as seen by the front-end.
///
/// The reported percentage never decreases, never exceeds
/// [`MAX_UNCONFIRMED_PERCENT`] from observations alone, and reaches 100 only
/// through [`complete`](Self::complete).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteProgress {
    total: u64,
    bytes: u64,
    percent: f64,
    completed: bool,
}

impl WriteProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            bytes: 0,
            percent: 0.0,
            completed: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Applies a parsed line. Returns whether the reported values changed.
    pub fn apply(&mut self, event: ProgressEvent) -> bool {
        match event {
            ProgressEvent::Bytes(bytes) => self.observe_bytes(bytes),
            ProgressEvent::Percent(percent) => self.observe_percent(percent, MAX_UNCONFIRMED_PERCENT),
            ProgressEvent::Unrecognized => false,
        }
    }

    /// Records an observed running byte count.
    pub fn observe_bytes(&mut self, bytes: u64) -> bool {
        if self.completed {
            return false;
        }
        let bytes = bytes.min(self.total);
        let grew = bytes > self.bytes;
        self.bytes = self.bytes.max(bytes);
        let percent = if self.total == 0 {
            0.0
        } else {
            self.bytes as f64 * 100.0 / self.total as f64
        };
        self.raise(percent, MAX_UNCONFIRMED_PERCENT) || grew
    }

    /// Records a percentage, clamped to `cap`.
    pub fn observe_percent(&mut self, percent: f64, cap: f64) -> bool {
        if self.completed || !percent.is_finite() {
            return false;
        }
        let changed = self.raise(percent, cap);
        if changed {
            let implied = (self.total as f64 * self.percent / 100.0) as u64;
            self.bytes = self.bytes.max(implied);
        }
        changed
    }

    /// Marks the write as confirmed by the copy tool's exit status.
    pub fn complete(&mut self) {
        self.completed = true;
        self.bytes = self.total;
        self.percent = 100.0;
    }

    fn raise(&mut self, percent: f64, cap: f64) -> bool {
        let clamped = percent.clamp(0.0, cap.min(MAX_UNCONFIRMED_PERCENT));
        if clamped > self.percent {
            self.percent = clamped;
            true
        } else {
            false
        }
    }
}
