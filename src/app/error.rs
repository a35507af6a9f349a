use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";
pub const ERR_CONFIG: &str = "ERR_CONFIG";
pub const ERR_USAGE: &str = "ERR_USAGE";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    /// Device-side failure: non-zero exit or failure text in the output.
    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    /// A required tool or path could not be resolved. Never retried.
    pub fn config(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONFIG, message, trace_id)
    }

    /// Programmer error: an operation was called in the wrong lifecycle state.
    pub fn usage(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_USAGE, message, trace_id)
    }

    pub fn timeout(what: &str, elapsed: Duration, trace_id: impl Into<String>) -> Self {
        Self::new(
            ERR_TIMEOUT,
            format!("Timed out waiting for {what} after {} ms", elapsed.as_millis()),
            trace_id,
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
