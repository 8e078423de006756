use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::log_writer::{DebouncedLogWriter, LogFile};

pub const MAX_LOG_ENTRIES: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSource {
    App,
    #[serde(alias = "V2RAY")]
    Engine,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "APP",
            Self::Engine => "ENGINE",
        })
    }
}

impl FromStr for LogSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "APP" => Ok(Self::App),
            "ENGINE" | "V2RAY" | "XRAY" => Ok(Self::Engine),
            other => Err(format!("unknown log source '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, level: LogLevel, source: LogSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            source,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.source,
            self.message
        )
    }
}

/// Destination for app and engine messages.
pub trait LogSink: Send + Sync {
    fn add_log(&self, message: &str, level: LogLevel, source: LogSource);

    /// Forwards every non-empty trimmed line of a raw output chunk.
    fn handle_engine_output(&self, chunk: &str) {
        for line in chunk.lines().map(str::trim).filter(|line| !line.is_empty()) {
            self.add_log(line, classify_engine_line(line), LogSource::Engine);
        }
    }
}

/// Severity guess for an engine output line. Engines that do not put these
/// words in their messages get misclassified.
pub fn classify_engine_line(line: &str) -> LogLevel {
    let lower = line.to_lowercase();

    if lower.contains("error") || lower.contains("failed") {
        LogLevel::Error
    } else if lower.contains("warning") || lower.contains("warn") {
        LogLevel::Warning
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

pub(crate) type SharedEntries = Arc<Mutex<VecDeque<LogEntry>>>;

pub(crate) fn lock_entries(entries: &SharedEntries) -> MutexGuard<'_, VecDeque<LogEntry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory ring of the newest entries, optionally persisted through a
/// [`DebouncedLogWriter`].
pub struct EngineLog {
    entries: SharedEntries,
    writer: Option<DebouncedLogWriter>,
}

impl EngineLog {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            writer: None,
        }
    }

    /// Loads what was stored in `file` and starts the background writer.
    pub fn persistent(file: LogFile) -> Self {
        let stored = file.load();
        log::debug!(
            "[logs] loaded {} stored entries from {}",
            stored.len(),
            file.path().display()
        );

        let mut entries: VecDeque<LogEntry> = stored.into();
        while entries.len() > MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        let entries = Arc::new(Mutex::new(entries));
        let writer = DebouncedLogWriter::spawn(file, entries.clone());

        Self {
            entries,
            writer: Some(writer),
        }
    }

    pub fn entries(&self, level: Option<LogLevel>, source: Option<LogSource>) -> Vec<LogEntry> {
        lock_entries(&self.entries)
            .iter()
            .filter(|entry| level.is_none_or(|level| entry.level == level))
            .filter(|entry| source.is_none_or(|source| entry.source == source))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock_entries(&self.entries).clear();
        self.flush();
    }

    pub fn flush(&self) {
        if let Some(ref writer) = self.writer {
            writer.flush();
        }
    }

    pub fn shutdown(&self) {
        if let Some(ref writer) = self.writer {
            writer.shutdown();
        }
    }
}

impl LogSink for EngineLog {
    fn add_log(&self, message: &str, level: LogLevel, source: LogSource) {
        match (source, level) {
            (LogSource::Engine, LogLevel::Error) => log::warn!("[engine] {message}"),
            (LogSource::Engine, _) => log::debug!("[engine] {message}"),
            (LogSource::App, _) => {}
        }

        {
            let mut entries = lock_entries(&self.entries);
            entries.push_back(LogEntry::new(message, level, source));
            while entries.len() > MAX_LOG_ENTRIES {
                entries.pop_front();
            }
        }

        if let Some(ref writer) = self.writer {
            writer.mark_dirty();
        }
    }
}

impl Drop for EngineLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prefers_error_over_warning() {
        assert_eq!(
            classify_engine_line("Warning: dial failed"),
            LogLevel::Error
        );
        assert_eq!(
            classify_engine_line("[Warning] core: deprecated field"),
            LogLevel::Warning
        );
        assert_eq!(classify_engine_line("[Debug] dns query"), LogLevel::Debug);
        assert_eq!(
            classify_engine_line("Xray 1.8.4 started"),
            LogLevel::Info
        );
    }

    #[test]
    fn output_chunks_are_split_and_trimmed() {
        let sink = EngineLog::in_memory();
        sink.handle_engine_output("  first line \n\n\r\nsecond error line\n   \n");

        let entries = sink.entries(None, None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first line");
        assert_eq!(entries[0].source, LogSource::Engine);
        assert_eq!(entries[1].level, LogLevel::Error);
    }

    #[test]
    fn keeps_only_newest_entries() {
        let sink = EngineLog::in_memory();
        for index in 0..(MAX_LOG_ENTRIES + 7) {
            sink.add_log(&format!("message {index}"), LogLevel::Info, LogSource::App);
        }

        let entries = sink.entries(None, None);
        assert_eq!(entries.len(), MAX_LOG_ENTRIES);
        assert_eq!(entries[0].message, "message 7");
    }

    #[test]
    fn entries_filter_by_level_and_source() {
        let sink = EngineLog::in_memory();
        sink.add_log("connecting", LogLevel::Info, LogSource::App);
        sink.add_log("bad config", LogLevel::Error, LogSource::App);
        sink.handle_engine_output("failed to dial");

        assert_eq!(sink.entries(Some(LogLevel::Error), None).len(), 2);
        assert_eq!(
            sink.entries(Some(LogLevel::Error), Some(LogSource::App))[0].message,
            "bad config"
        );
        assert_eq!(sink.entries(None, Some(LogSource::Engine)).len(), 1);

        sink.clear();
        assert!(sink.entries(None, None).is_empty());
    }

    #[test]
    fn filter_names_parse_case_insensitively() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("Error".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("v2ray".parse::<LogSource>(), Ok(LogSource::Engine));
        assert!("trace".parse::<LogLevel>().is_err());
    }

    #[test]
    fn legacy_source_name_is_accepted() {
        let entry: LogEntry = serde_json::from_str(
            r#"{"id":"6f1c3b52-32a4-4a4e-9d0b-2f7e6c1d9a10","timestamp":"2025-03-13T08:00:00Z","level":"WARNING","source":"V2RAY","message":"m"}"#,
        )
        .unwrap();
        assert_eq!(entry.source, LogSource::Engine);
        assert_eq!(entry.level, LogLevel::Warning);
    }
}
