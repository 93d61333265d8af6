//! Plain-text status lines for the user
//!
//! The controller reports progress through a [`LogSink`] instead of calling
//! `tracing` directly, so a front end can show the same lines it logs.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// Receiver of user-facing status lines
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, line: &str);

    fn info(&self, line: &str) {
        self.log(LogLevel::Info, line);
    }

    fn warn(&self, line: &str) {
        self.log(LogLevel::Warn, line);
    }

    fn error(&self, line: &str) {
        self.log(LogLevel::Error, line);
    }
}

/// Forwards lines to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Info => tracing::info!("{line}"),
            LogLevel::Warn => tracing::warn!("{line}"),
            LogLevel::Error => tracing::error!("{line}"),
        }
    }
}

/// Keeps every line in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    lines: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl MemoryLogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded lines
    #[must_use]
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded lines at `level`, text only
    #[must_use]
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, line)| line.contains(needle))
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, level: LogLevel, line: &str) {
        tracing::debug!("[{level}] {line}");
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryLogSink::new();
        sink.info("first");
        sink.warn("second");
        sink.error("third");

        assert_eq!(
            sink.lines(),
            vec![
                (LogLevel::Info, "first".to_string()),
                (LogLevel::Warn, "second".to_string()),
                (LogLevel::Error, "third".to_string()),
            ]
        );
        assert_eq!(sink.messages(LogLevel::Warn), vec!["second".to_string()]);
        assert!(sink.contains("thi"));
        assert!(!sink.contains("fourth"));
    }

    #[test]
    fn test_memory_sink_clones_share_lines() {
        let sink = MemoryLogSink::new();
        let clone = sink.clone();
        clone.info("shared");
        assert_eq!(sink.lines().len(), 1);
    }
}
