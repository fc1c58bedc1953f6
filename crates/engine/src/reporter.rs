//! Reporter module for clipcache
//!
//! The engine never talks to a logging backend directly. Lifecycle and
//! progress messages go through the four-level [`Reporter`] contract, and the
//! host decides where they end up. [`TracingReporter`] is the default and
//! forwards everything to `tracing`.

use std::sync::{Arc, Mutex};

/// Severity of a reported message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Info,
    Verbose,
    Warn,
    Error,
}

/// Leveled sink for engine messages.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn verbose(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);

    /// Completion percentage of the running transcode, 0 to 100. Sent
    /// alongside the verbose progress message; ignored by default.
    fn progress(&self, _percent: f64) {}
}

/// Reporter handle shared between pipeline components.
pub type SharedReporter = Arc<dyn Reporter>;

/// Forwards messages to the `tracing` macros; verbose maps to `debug`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, message: &str) {
        tracing::info!(target: "clipcache", "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "clipcache", "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "clipcache", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "clipcache", "{}", message);
    }
}

/// Keeps every message in memory, in order.
///
/// Useful for embedding hosts that batch output, and for asserting on what
/// the engine reported.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    entries: Mutex<Vec<(ReportLevel, String)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn entries(&self) -> Vec<(ReportLevel, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Messages reported at the given level.
    pub fn messages(&self, level: ReportLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }

    fn push(&self, level: ReportLevel, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

impl Reporter for MemoryReporter {
    fn info(&self, message: &str) {
        self.push(ReportLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(ReportLevel::Verbose, message);
    }

    fn warn(&self, message: &str) {
        self.push(ReportLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(ReportLevel::Error, message);
    }
}
