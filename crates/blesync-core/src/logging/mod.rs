//! 日志模块
//!
//! 日志级别、日志条目，以及记录同步事件的有界事件日志。

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    /// 获取对应的 Emoji 图标
    pub fn icon(&self) -> &'static str {
        match self {
            LogLevel::Error => "❌",
            LogLevel::Warn => "⚠️",
            LogLevel::Info => "ℹ️",
            LogLevel::Debug => "🔍",
        }
    }

    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 日志条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.icon(), self.message)
    }
}

/// 有界事件日志
///
/// 超出容量时丢弃最旧的条目。
#[derive(Debug, Clone)]
pub struct EventJournal {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// 最近的 `limit` 条，按时间顺序
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_drops_oldest() {
        let mut journal = EventJournal::new(2);
        journal.push(LogEntry::new(LogLevel::Info, "one"));
        journal.push(LogEntry::new(LogLevel::Info, "two"));
        journal.push(LogEntry::new(LogLevel::Warn, "three"));

        let messages: Vec<_> = journal.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["two", "three"]);
    }

    #[test]
    fn test_recent_returns_tail_in_order() {
        let mut journal = EventJournal::new(8);
        for i in 0..5 {
            journal.push(LogEntry::new(LogLevel::Debug, format!("event {}", i)));
        }
        let recent = journal.recent(2);
        assert_eq!(recent[0].message, "event 3");
        assert_eq!(recent[1].message, "event 4");
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert_eq!(log::Level::from(LogLevel::Warn), log::Level::Warn);
    }
}
