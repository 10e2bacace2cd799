use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing(default_level: Level) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy()
        });

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Error,
}

impl LogStream {
    pub fn label(self) -> &'static str {
        match self {
            LogStream::Stdout => "STDOUT",
            LogStream::Stderr => "STDERR",
            LogStream::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

impl LogEntry {
    pub fn new(stream: LogStream, text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stream,
            text: text.into(),
        }
    }

    pub fn format_line(&self) -> String {
        format!(
            "[{timestamp}] [{stream}] {text}",
            timestamp = self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            stream = self.stream.label(),
            text = sanitize_message(&self.text)
        )
    }
}

/// Fixed-capacity FIFO of captured worker output; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    /// The most recent `count` entries, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries evicted since the buffer was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn sanitize_message(message: &str) -> String {
    message
        .trim_end_matches(['\n', '\r'])
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_most_recent_entries_in_order() {
        let mut buffer = LogBuffer::new(3);
        for index in 0..5 {
            buffer.push(LogEntry::new(LogStream::Stdout, format!("line {index}")));
        }

        let texts: Vec<_> = buffer.tail(10).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.dropped(), 2);
    }

    #[test]
    fn tail_returns_only_requested_suffix() {
        let mut buffer = LogBuffer::new(10);
        for index in 0..4 {
            buffer.push(LogEntry::new(LogStream::Stderr, format!("e{index}")));
        }
        let texts: Vec<_> = buffer.tail(2).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["e2", "e3"]);
    }

    #[test]
    fn format_line_tags_stream_and_flattens_newlines() {
        let entry = LogEntry::new(LogStream::Error, "spawn failed\r\nretry\n");
        let line = entry.format_line();
        assert!(line.starts_with('['));
        assert!(line.ends_with("[ERROR] spawn failed  retry"));
    }
}
