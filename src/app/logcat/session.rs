use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::client::{device_args, Adb};
use crate::app::adb::parse::parse_pidof;
use crate::app::adb::runner::StreamingProcess;
use crate::app::config::LogcatSettings;
use crate::app::dispatcher::{TaskDispatcher, TaskResult};
use crate::app::error::AppError;
use crate::app::logcat::filter::LogFilter;
use crate::app::logcat::parser::LogEntryParser;
use crate::app::models::{LogEntry, LogFormat};

const READER_JOIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogcatRequest {
    pub serial: String,
    pub format: LogFormat,
    pub buffers: Vec<String>,
    pub pid: Option<u32>,
    /// Raw `tag:priority` filter specs passed through to logcat.
    pub filterspecs: Vec<String>,
}

impl LogcatRequest {
    pub fn new(serial: &str, settings: &LogcatSettings) -> Self {
        Self {
            serial: serial.to_string(),
            format: settings.format,
            buffers: settings.buffers.clone(),
            pid: None,
            filterspecs: Vec::new(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "logcat".to_string(),
            "-v".to_string(),
            self.format.as_arg().to_string(),
        ];
        for buffer in self.buffers.iter().filter(|buffer| !buffer.trim().is_empty()) {
            args.push("-b".to_string());
            args.push(buffer.trim().to_string());
        }
        if let Some(pid) = self.pid {
            args.push(format!("--pid={pid}"));
        }
        args.extend(
            self.filterspecs
                .iter()
                .filter(|spec| !spec.trim().is_empty())
                .cloned(),
        );
        args
    }
}

type BatchCallback = Box<dyn FnMut(&[LogEntry])>;

/// A live (or file-backed) log stream. Raw lines are read on a background
/// thread; parsing and the entry buffer belong to the thread calling
/// [`drain`](Self::drain).
pub struct LogcatSession {
    serial: String,
    trace_id: String,
    parser: LogEntryParser,
    lines: Arc<Mutex<Vec<String>>>,
    stream_ended: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    process: Option<Box<dyn StreamingProcess>>,
    reader: Option<JoinHandle<()>>,
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    evicted: u64,
    on_batch: Option<BatchCallback>,
}

impl LogcatSession {
    pub fn start(
        adb: &Adb,
        request: &LogcatRequest,
        max_entries: usize,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let mut process = adb.spawn(&request.serial, &request.args(), trace_id)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| AppError::system("Failed to capture logcat stdout", trace_id))?;
        info!(trace_id = %trace_id, serial = %request.serial, "logcat started");
        let mut session = Self::from_reader(&request.serial, request.format, stdout, max_entries, trace_id);
        session.process = Some(process);
        Ok(session)
    }

    /// Same pipeline over any byte source, such as a saved log file.
    pub fn from_reader(
        serial: &str,
        format: LogFormat,
        reader: impl Read + Send + 'static,
        max_entries: usize,
        trace_id: &str,
    ) -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let stream_ended = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(
            Box::new(reader),
            Arc::clone(&lines),
            Arc::clone(&stream_ended),
            Arc::clone(&stop_flag),
            trace_id.to_string(),
        );
        Self {
            serial: serial.to_string(),
            trace_id: trace_id.to_string(),
            parser: LogEntryParser::new(format),
            lines,
            stream_ended,
            stop_flag,
            process: None,
            reader: Some(handle),
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            evicted: 0,
            on_batch: None,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_on_batch(&mut self, callback: impl FnMut(&[LogEntry]) + 'static) {
        self.on_batch = Some(Box::new(callback));
    }

    /// Parses everything read since the last call and returns the number of
    /// new entries. A call that finds no new lines flushes the entry held
    /// back by the parser, as does the end of the stream.
    pub fn drain(&mut self) -> usize {
        let ended = self.stream_ended.load(Ordering::SeqCst);
        let raw = std::mem::take(&mut *self.lines.lock().unwrap_or_else(PoisonError::into_inner));

        let mut batch = Vec::new();
        let quiet = raw.is_empty();
        for line in raw {
            batch.extend(self.parser.push_line(&line));
        }
        if quiet || ended {
            batch.extend(self.parser.flush());
        }
        if batch.is_empty() {
            return 0;
        }

        for entry in &batch {
            self.entries.push_back(entry.clone());
        }
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
            self.evicted += 1;
        }
        if let Some(callback) = self.on_batch.as_mut() {
            callback(&batch);
        }
        batch.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped from the front of the buffer to respect the cap.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn filtered(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, AppError> {
        let compiled = filter.compile(&self.trace_id)?;
        Ok(self
            .entries
            .iter()
            .filter(|entry| compiled.matches(entry))
            .cloned()
            .collect())
    }

    /// Clears the local buffer only; see [`clear_device_log`] for the device.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True until the underlying stream reaches its end.
    pub fn is_streaming(&self) -> bool {
        !self.stream_ended.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        let Some(handle) = self.reader.take() else {
            return;
        };
        let deadline = Instant::now() + READER_JOIN_WAIT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
            debug!(trace_id = %self.trace_id, serial = %self.serial, "logcat stopped");
        } else {
            warn!(trace_id = %self.trace_id, serial = %self.serial, "logcat reader still blocked; detached");
        }
    }
}

impl Drop for LogcatSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_reader(
    reader: Box<dyn Read + Send>,
    lines: Arc<Mutex<Vec<String>>>,
    stream_ended: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    trace_id: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    lines
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(line);
                }
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "logcat read failed");
                    break;
                }
            }
        }
        stream_ended.store(true, Ordering::SeqCst);
    })
}

/// Clears the device's log buffers on the worker.
pub fn clear_device_log(
    dispatcher: &TaskDispatcher,
    adb: &Adb,
    serial: &str,
    trace_id: &str,
    on_complete: impl FnOnce(TaskResult<()>) + 'static,
) {
    let args = device_args(serial, &["logcat", "-c"]);
    dispatcher.schedule(
        (adb.clone(), args, trace_id.to_string()),
        |(adb, args, trace_id)| {
            adb.run_checked(&args, "adb logcat -c", &trace_id)
                .map(|_| ())
        },
        on_complete,
        false,
    );
}

/// Resolves a running package to its pid for `--pid` filtering.
pub fn resolve_package_pid(
    adb: &Adb,
    serial: &str,
    package: &str,
    trace_id: &str,
) -> Result<u32, AppError> {
    let output = adb.run(&device_args(serial, &["shell", "pidof", package]), trace_id)?;
    parse_pidof(&output.stdout).ok_or_else(|| {
        AppError::validation(format!("Process not running: {package}"), trace_id)
    })
}
