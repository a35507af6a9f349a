use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
    Unknown(String),
}

impl DeviceState {
    pub fn from_token(token: &str) -> Self {
        match token {
            "device" => DeviceState::Online,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            other => DeviceState::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub state: DeviceState,
    pub architecture: Option<String>,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.state == DeviceState::Online
    }

    /// Devices reached over TCP are listed as `host:port`.
    pub fn is_network(&self) -> bool {
        self.id.contains(':')
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogPriority {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LogPriority {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'V' => Some(LogPriority::Verbose),
            'D' => Some(LogPriority::Debug),
            'I' => Some(LogPriority::Info),
            'W' => Some(LogPriority::Warn),
            'E' => Some(LogPriority::Error),
            'F' | 'A' => Some(LogPriority::Fatal),
            'S' => Some(LogPriority::Silent),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            LogPriority::Verbose => 'V',
            LogPriority::Debug => 'D',
            LogPriority::Info => 'I',
            LogPriority::Warn => 'W',
            LogPriority::Error => 'E',
            LogPriority::Fatal => 'F',
            LogPriority::Silent => 'S',
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `P/Tag( pid): message`
    Brief,
    /// `MM-DD HH:MM:SS.mmm  pid  tid P Tag: message`
    #[default]
    Threadtime,
}

impl LogFormat {
    pub fn as_arg(self) -> &'static str {
        match self {
            LogFormat::Brief => "brief",
            LogFormat::Threadtime => "threadtime",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: Option<String>,
    pub pid: u32,
    pub tid: Option<u32>,
    pub priority: LogPriority,
    pub tag: String,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ts) = &self.timestamp {
            write!(f, "{ts} ")?;
        }
        match self.tid {
            Some(tid) => write!(f, "{:>5} {:>5} ", self.pid, tid)?,
            None => write!(f, "{:>5} ", self.pid)?,
        }
        write!(f, "{} {}: {}", self.priority.letter(), self.tag, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub installer: Option<String>,
    pub uid: Option<u32>,
    pub details: Vec<KeyValue>,
    pub raw: Vec<String>,
}

impl PackageEntry {
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|pair| pair.key == key)
            .map(|pair| pair.value.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Completed,
    Failed,
}

impl CaptureState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CaptureState::Starting | CaptureState::Recording | CaptureState::Stopping
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureDetail {
    Video {
        path: PathBuf,
        size_bytes: u64,
        frames: Option<u64>,
    },
    Screenshot {
        width: u32,
        height: u32,
    },
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub serial: String,
    pub result: CaptureResult,
    pub detail: CaptureDetail,
    pub error: Option<String>,
}

impl CaptureOutcome {
    pub fn failure(serial: &str, error: impl Into<String>) -> Self {
        Self {
            serial: serial.to_string(),
            result: CaptureResult::Failure,
            detail: CaptureDetail::None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == CaptureResult::Success
    }
}
