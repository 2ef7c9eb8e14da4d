//! Progress events and line classification.
//!
//! The analysis program prints free-form lines; agents prefix theirs with a
//! bracketed label such as `[Market Data Agent]`. That label becomes the event's
//! `step`. Nothing about this format is a contract we control, so classification
//! stays lenient.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const STEP_SYSTEM: &str = "system";
pub const STEP_ERROR: &str = "error";

/// One classified line of subprocess output (or a synthetic system notice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: String,
    pub message: String,
    /// Epoch millis, non-decreasing within a job.
    pub timestamp: i64,
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Extract the leading `[label]` of a line, if any.
pub fn step_label(line: &str) -> Option<&str> {
    static RE_LABEL: OnceCell<Regex> = OnceCell::new();
    let re = RE_LABEL.get_or_init(|| Regex::new(r"^\s*\[([^\[\]]+)\]").expect("step label regex"));
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

/// Classify a complete line into `(step, message)`.
///
/// Stderr lines are always `error` and carry an `Error:` prefix.
pub fn classify(stream: Stream, line: &str) -> (String, String) {
    let text = line.trim();
    match stream {
        Stream::Stderr => (STEP_ERROR.to_string(), format!("Error: {text}")),
        Stream::Stdout => {
            let step = step_label(text).unwrap_or(STEP_SYSTEM);
            (step.to_string(), text.to_string())
        }
    }
}

/// Wall clock that never runs backwards for the lifetime of one job.
#[derive(Debug, Default)]
pub struct EventClock {
    last: i64,
}

impl EventClock {
    pub fn now(&mut self) -> i64 {
        let t = chrono::Utc::now().timestamp_millis().max(self.last);
        self.last = t;
        t
    }
}

/// Reassembles lines from arbitrarily split byte chunks.
///
/// A trailing partial line is held until the next chunk or [`LineAssembler::finish`].
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes (without `\r\n`/`\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            out.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        out
    }

    /// Flush the held-over partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_line_yields_label_as_step() {
        let (step, msg) = classify(Stream::Stdout, "[Market Data Agent] Fetching data for AAPL...");
        assert_eq!(step, "Market Data Agent");
        assert_eq!(msg, "[Market Data Agent] Fetching data for AAPL...");

        let (step, _) = classify(Stream::Stdout, "  [OK] Memo generation complete in 3.1s");
        assert_eq!(step, "OK");
    }

    #[test]
    fn unlabeled_line_is_system() {
        let (step, msg) = classify(Stream::Stdout, "Ticker: AAPL");
        assert_eq!(step, STEP_SYSTEM);
        assert_eq!(msg, "Ticker: AAPL");

        // label must lead the line
        assert_eq!(step_label("note [x] later"), None);
        assert_eq!(step_label("[] empty"), None);
    }

    #[test]
    fn stderr_line_is_error_with_prefix() {
        let (step, msg) = classify(Stream::Stderr, "[Risk Agent] boom");
        assert_eq!(step, STEP_ERROR);
        assert_eq!(msg, "Error: [Risk Agent] boom");
    }

    #[test]
    fn assembler_handles_split_lines() {
        let mut a = LineAssembler::new();
        assert!(a.push(b"[Macro").is_empty());
        assert_eq!(a.push(b" Agent] start\r\nsecond"), vec!["[Macro Agent] start".to_string()]);
        assert_eq!(a.push(b" half\n\n"), vec!["second half".to_string(), String::new()]);
        assert_eq!(a.finish(), None);

        a.push(b"tail without newline");
        assert_eq!(a.finish().as_deref(), Some("tail without newline"));
        assert_eq!(a.finish(), None);
    }

    #[test]
    fn assembler_keeps_multibyte_chars_across_chunks() {
        let mut a = LineAssembler::new();
        let bytes = "€ price\n".as_bytes();
        assert!(a.push(&bytes[..1]).is_empty());
        assert_eq!(a.push(&bytes[1..]), vec!["€ price".to_string()]);
    }

    #[test]
    fn clock_is_monotonic() {
        let mut c = EventClock { last: i64::MAX - 1 };
        assert_eq!(c.now(), i64::MAX - 1);
        assert!(c.now() >= i64::MAX - 1);
    }
}
