use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Render as `[HH:MM:SS] message`.
    #[must_use]
    pub fn line(&self) -> String {
        let clock = self
            .at
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_else(|_| "--:--:--".to_string());
        format!("[{clock}] {}", self.message)
    }
}

/// Advisory feedback for one restore run: an append-only log and a 0-100 progress
/// value that only moves forward. Nothing here is persisted.
#[derive(Debug, Clone, Default)]
pub struct RestoreContext {
    entries: Vec<LogEntry>,
    progress: u8,
}

impl RestoreContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "crewdesk::restore", "{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "crewdesk::restore", "{message}");
        self.push(LogLevel::Warn, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.entries.push(LogEntry { at: OffsetDateTime::now_utc(), level, message });
    }

    /// Advance progress to `percent`, clamped to 100. Lower values are ignored.
    pub fn checkpoint(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            tracing::debug!(target: "crewdesk::restore", progress = percent, "progress checkpoint");
        }
    }

    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(LogEntry::line).collect()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.level == LogLevel::Warn)
            .map(|entry| entry.message.as_str())
            .collect()
    }
}
