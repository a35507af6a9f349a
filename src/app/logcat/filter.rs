use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::app::error::AppError;
use crate::app::models::{LogEntry, LogPriority};

/// View filter over parsed entries. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogFilter {
    pub min_priority: Option<LogPriority>,
    pub tag: Option<String>,
    pub pid: Option<u32>,
    /// Case-insensitive substring of the message or tag.
    pub text: Option<String>,
    pub regex: Option<String>,
}

/// A [`LogFilter`] with its pattern compiled once.
pub struct CompiledLogFilter {
    filter: LogFilter,
    text: Option<String>,
    regex: Option<Regex>,
}

impl LogFilter {
    pub fn compile(&self, trace_id: &str) -> Result<CompiledLogFilter, AppError> {
        let regex = match self.regex.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| {
                        AppError::validation(format!("Invalid log filter regex: {err}"), trace_id)
                    })?,
            ),
            _ => None,
        };
        let text = self
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_lowercase);
        Ok(CompiledLogFilter {
            filter: self.clone(),
            text,
            regex,
        })
    }
}

impl CompiledLogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.filter.min_priority {
            if entry.priority < min {
                return false;
            }
        }
        if let Some(tag) = self.filter.tag.as_deref().filter(|tag| !tag.is_empty()) {
            if entry.tag != tag {
                return false;
            }
        }
        if let Some(pid) = self.filter.pid {
            if entry.pid != pid {
                return false;
            }
        }
        if let Some(text) = &self.text {
            if !entry.message.to_lowercase().contains(text) && !entry.tag.to_lowercase().contains(text) {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if !regex.is_match(&entry.message) && !regex.is_match(&entry.tag) {
                return false;
            }
        }
        true
    }
}
