//! Destinations for supervised-process output and lifecycle events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// Severity of one log record. `Success` marks milestone lines such as a proxy
/// reporting that it logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}

/// Receives classified output lines and lifecycle messages.
pub trait LogSink: Send + Sync {
    fn record(&self, level: LogLevel, tag: &str, message: &str, config_id: Option<&str>);
}

/// Forwards records to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, level: LogLevel, tag: &str, message: &str, config_id: Option<&str>) {
        let config_id = config_id.unwrap_or("-");
        match level {
            LogLevel::Debug => tracing::debug!(tag, config_id, "{message}"),
            LogLevel::Info => tracing::info!(tag, config_id, "{message}"),
            LogLevel::Success => tracing::info!(tag, config_id, success = true, "{message}"),
            LogLevel::Warn => tracing::warn!(tag, config_id, "{message}"),
            LogLevel::Error => tracing::error!(tag, config_id, "{message}"),
        }
    }
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub tag: String,
    pub message: String,
    pub config_id: Option<String>,
}

/// Keeps the newest entries in memory.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemorySink {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Snapshot of all retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Retained entries for one configuration.
    pub fn entries_for(&self, config_id: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.config_id.as_deref() == Some(config_id))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemorySink {
    fn record(&self, level: LogLevel, tag: &str, message: &str, config_id: Option<&str>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            tag: tag.to_string(),
            message: message.to_string(),
            config_id: config_id.map(String::from),
        };
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Fans one record out to several sinks.
pub struct TeeSink(pub Vec<std::sync::Arc<dyn LogSink>>);

impl LogSink for TeeSink {
    fn record(&self, level: LogLevel, tag: &str, message: &str, config_id: Option<&str>) {
        for sink in &self.0 {
            sink.record(level, tag, message, config_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_sink_is_bounded() {
        let sink = MemorySink::with_capacity(3);
        for i in 0..5 {
            sink.record(LogLevel::Info, "t", &format!("line {i}"), None);
        }
        let messages: Vec<String> = sink.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_filter_by_config() {
        let sink = MemorySink::new();
        sink.record(LogLevel::Success, "frpc", "start frpc success", Some("a"));
        sink.record(LogLevel::Error, "frpc", "login failed", Some("b"));
        sink.record(LogLevel::Info, "service", "hello", None);

        let a = sink.entries_for("a");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].level, LogLevel::Success);
        assert_eq!(sink.entries().len(), 3);

        sink.clear();
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn test_tee_sink_reaches_all() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let tee = TeeSink(vec![first.clone(), second.clone(), Arc::new(TracingSink)]);
        tee.record(LogLevel::Warn, "t", "m", Some("x"));
        assert_eq!(first.entries().len(), 1);
        assert_eq!(second.entries().len(), 1);
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Success.to_string(), "SUCCESS");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }
}
