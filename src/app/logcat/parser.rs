use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::trace;

use crate::app::models::{LogEntry, LogFormat, LogPriority};

fn brief_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<priority>[A-Z])/(?P<tag>[^(]*?)\(\s*(?P<pid>\d+)\):\s?(?P<msg>.*)$")
            .expect("brief logcat regex")
    })
}

fn threadtime_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<date>\d{2}-\d{2})\s+(?P<time>\d{2}:\d{2}:\d{2}\.\d{3})\s+(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<priority>[A-Z])\s+(?P<tag>[^:]*?)\s*:\s?(?P<msg>.*)$",
        )
        .expect("threadtime logcat regex")
    })
}

/// What a single line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Header,
    Continuation,
    /// Banner, blank or rejected header; nothing was recorded.
    Skipped,
}

/// Incremental logcat parser for one log source.
///
/// Entries are held back until the next header (or [`flush`](Self::flush))
/// because following lines may still extend the message.
#[derive(Debug)]
pub struct LogEntryParser {
    format: LogFormat,
    pending: Option<LogEntry>,
    seen_header: bool,
}

impl LogEntryParser {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            pending: None,
            seen_header: false,
        }
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Feeds one line; returns the entry completed by it, if any.
    pub fn push_line(&mut self, line: &str) -> Option<LogEntry> {
        self.push_line_kind(line).1
    }

    pub fn push_line_kind(&mut self, line: &str) -> (LineKind, Option<LogEntry>) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with("--------- ") {
            return (LineKind::Skipped, None);
        }

        let captures = match self.format {
            LogFormat::Brief => brief_re().captures(line),
            LogFormat::Threadtime => threadtime_re().captures(line),
        };
        if let Some(caps) = captures {
            return match self.header_entry(&caps) {
                Some(entry) => {
                    self.seen_header = true;
                    let completed = self.pending.replace(entry).and_then(finish);
                    (LineKind::Header, completed)
                }
                None => {
                    trace!(line = %line, "rejected logcat header");
                    (LineKind::Skipped, None)
                }
            };
        }

        match self.pending.as_mut() {
            Some(entry) => {
                if entry.message.is_empty() {
                    entry.message = line.to_string();
                } else {
                    entry.message.push('\n');
                    entry.message.push_str(line);
                }
                (LineKind::Continuation, None)
            }
            None => {
                if self.seen_header {
                    trace!("continuation after flush dropped");
                }
                (LineKind::Skipped, None)
            }
        }
    }

    /// Emits the held-back entry.
    pub fn flush(&mut self) -> Option<LogEntry> {
        self.pending.take().and_then(finish)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn header_entry(&self, caps: &Captures<'_>) -> Option<LogEntry> {
        let priority = caps["priority"]
            .chars()
            .next()
            .and_then(LogPriority::from_letter)?;
        let pid = caps["pid"].trim().parse().ok()?;
        let (timestamp, tid) = match self.format {
            LogFormat::Brief => (None, None),
            LogFormat::Threadtime => (
                Some(format!("{} {}", &caps["date"], &caps["time"])),
                Some(caps["tid"].parse().ok()?),
            ),
        };
        Some(LogEntry {
            timestamp,
            pid,
            tid,
            priority,
            tag: caps["tag"].trim().to_string(),
            message: caps["msg"].to_string(),
        })
    }
}

fn finish(entry: LogEntry) -> Option<LogEntry> {
    if entry.message.is_empty() {
        trace!(tag = %entry.tag, "empty log message dropped");
        return None;
    }
    Some(entry)
}

/// Parses a complete text (a saved log file) in one go.
pub fn parse_text(format: LogFormat, text: &str) -> Vec<LogEntry> {
    let mut parser = LogEntryParser::new(format);
    let mut entries: Vec<LogEntry> = text.lines().filter_map(|line| parser.push_line(line)).collect();
    entries.extend(parser.flush());
    entries
}
