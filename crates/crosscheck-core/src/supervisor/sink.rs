//! Destinations for lines read from supervised processes.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Shared, append-only destination for child output.
///
/// Several processes (a worker and a client) write concurrently, so
/// implementations serialize whole lines; nothing else is shared with the
/// orchestration code.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, label: &str, stream: Stream, line: &str);
}

/// Prints `[label] line` to the harness's own stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_line(&self, label: &str, _stream: Stream, line: &str) {
        // The stdout lock keeps lines from different readers whole.
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "[{label}] {}", line.trim_end());
    }
}

/// A line captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub label: String,
    pub stream: Stream,
    pub line: String,
}

/// Keeps every line in memory; used by tests and by callers that want to
/// inspect child output after the fact.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<CapturedLine>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything captured so far.
    pub fn lines(&self) -> Vec<CapturedLine> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Lines for one label, in arrival order.
    pub fn lines_for(&self, label: &str) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.label == label)
            .map(|l| l.line)
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, label: &str, stream: Stream, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(CapturedLine {
                label: label.to_string(),
                stream,
                line: line.trim_end().to_string(),
            });
        }
    }
}
