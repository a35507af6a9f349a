use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::app::adb::client::Adb;
use crate::app::adb::paths::{remote_capture_path, remote_file_name};
use crate::app::adb::runner::StreamingProcess;
use crate::app::capture::progress::{parse_record_line, RecordProgress};
use crate::app::capture::screenshot::{capture_screenshot, save_image, HeldScreenshot};
use crate::app::config::{AppConfig, ScreenRecordSettings, ScreenshotSettings};
use crate::app::dispatcher::{TaskDispatcher, TaskResult, TimerId};
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::{CaptureDetail, CaptureOutcome, CaptureResult, CaptureState};

const EXIT_POLL: Duration = Duration::from_millis(20);
const READER_JOIN_WAIT: Duration = Duration::from_millis(500);

pub type CaptureCallback = Box<dyn FnOnce(CaptureOutcome)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOptions {
    pub duration: Option<Duration>,
    /// `WIDTHxHEIGHT`
    pub size: Option<String>,
    /// Bits per second, e.g. `4000000` or `4M`.
    pub bit_rate: Option<String>,
}

impl RecordOptions {
    pub fn from_settings(settings: &ScreenRecordSettings) -> Self {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        Self {
            duration: (settings.time_limit_sec > 0)
                .then(|| Duration::from_secs(settings.time_limit_sec)),
            size: non_empty(&settings.size),
            bit_rate: non_empty(&settings.bit_rate),
        }
    }
}

/// `shell screenrecord --verbose [options] <remote>`
pub fn screenrecord_command(options: &RecordOptions, remote_path: &str) -> Vec<String> {
    let mut command = vec![
        "shell".to_string(),
        "screenrecord".to_string(),
        "--verbose".to_string(),
    ];
    if let Some(duration) = options.duration {
        let mut seconds = duration.as_secs();
        if duration.subsec_nanos() > 0 {
            seconds += 1;
        }
        command.push("--time-limit".to_string());
        command.push(seconds.max(1).to_string());
    }
    if let Some(size) = options.size.as_deref().filter(|size| !size.trim().is_empty()) {
        command.push("--size".to_string());
        command.push(size.trim().to_string());
    }
    if let Some(bit_rate) = options.bit_rate.as_deref().filter(|rate| !rate.trim().is_empty()) {
        command.push("--bit-rate".to_string());
        command.push(bit_rate.trim().to_string());
    }
    command.push(remote_path.to_string());
    command
}

struct RecordingSession {
    state: CaptureState,
    trace_id: String,
    remote_path: String,
    local_path: PathBuf,
    duration: Option<Duration>,
    process: Option<Box<dyn StreamingProcess>>,
    reader: Option<JoinHandle<()>>,
    progress: Arc<Mutex<Vec<RecordProgress>>>,
    stop_requested: bool,
    auto_stop: Option<TimerId>,
    on_complete: Option<CaptureCallback>,
}

#[derive(Default)]
struct CaptureBook {
    sessions: HashMap<String, RecordingSession>,
    errors: HashMap<String, Vec<String>>,
    screenshot: Option<HeldScreenshot>,
}

struct StopJob {
    adb: Adb,
    serial: String,
    process: Option<Box<dyn StreamingProcess>>,
    reader: Option<JoinHandle<()>>,
    remote_path: String,
    local_path: PathBuf,
    stop_timeout: Duration,
    finalize_delay: Duration,
    trace_id: String,
}

struct StopReport {
    size_bytes: u64,
    notes: Vec<String>,
}

struct ControllerCore {
    dispatcher: Rc<TaskDispatcher>,
    adb: Adb,
    record: ScreenRecordSettings,
    screenshot: ScreenshotSettings,
    output_dir: PathBuf,
    book: RefCell<CaptureBook>,
}

/// Per-device screen recording and screenshot state. All state lives on the
/// thread that owns the dispatcher; device work runs on its worker.
#[derive(Clone)]
pub struct DeviceCaptureController {
    core: Rc<ControllerCore>,
}

pub fn resolve_output_dir(output_path: &str) -> PathBuf {
    let trimmed = output_path.trim();
    if !trimmed.is_empty() {
        return PathBuf::from(trimmed);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lazy_greentea_captures")
}

impl DeviceCaptureController {
    pub fn new(dispatcher: Rc<TaskDispatcher>, adb: Adb, config: &AppConfig) -> Self {
        Self {
            core: Rc::new(ControllerCore {
                dispatcher,
                adb,
                record: config.screen_record.clone(),
                screenshot: config.screenshot.clone(),
                output_dir: resolve_output_dir(&config.output_path),
                book: RefCell::new(CaptureBook::default()),
            }),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.core.output_dir
    }

    /// Starts `screenrecord` on `serial`. Fails synchronously, leaving the
    /// running session alone, if that device is already recording.
    pub fn start_recording(
        &self,
        serial: &str,
        options: RecordOptions,
        on_complete: impl FnOnce(CaptureOutcome) + 'static,
    ) -> Result<(), AppError> {
        self.core
            .start_recording(serial, options, Box::new(on_complete))
    }

    /// Returns false when `serial` has no active session.
    pub fn stop_recording(&self, serial: &str) -> bool {
        self.core.stop_recording(serial)
    }

    pub fn state(&self, serial: &str) -> CaptureState {
        self.core
            .book
            .borrow()
            .sessions
            .get(serial)
            .map(|session| session.state)
            .unwrap_or(CaptureState::Idle)
    }

    pub fn is_recording(&self, serial: &str) -> bool {
        self.state(serial).is_active()
    }

    /// `screenrecord --verbose` events seen so far for the latest session.
    pub fn progress(&self, serial: &str) -> Vec<RecordProgress> {
        self.core
            .book
            .borrow()
            .sessions
            .get(serial)
            .map(|session| {
                session
                    .progress
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default()
    }

    pub fn queue_screen_capture(
        &self,
        serial: &str,
        on_complete: impl FnOnce(CaptureOutcome) + 'static,
    ) -> Result<(), AppError> {
        self.core.queue_screen_capture(serial, Box::new(on_complete))
    }

    /// Size and source device of the held screenshot.
    pub fn screenshot_info(&self) -> Option<(String, u32, u32)> {
        self.core.book.borrow().screenshot.as_ref().map(|held| {
            let (width, height) = held.dimensions();
            (held.serial.clone(), width, height)
        })
    }

    pub fn save_screenshot(&self, path: &Path) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let book = self.core.book.borrow();
        let held = book
            .screenshot
            .as_ref()
            .ok_or_else(|| AppError::validation("No screenshot captured", &trace_id))?;
        save_image(&held.image, path, &trace_id)?;
        info!(trace_id = %trace_id, path = %path.display(), "screenshot saved");
        Ok(())
    }

    /// Diagnostics accumulated for `serial`, oldest first.
    pub fn errors(&self, serial: &str) -> Vec<String> {
        self.core
            .book
            .borrow()
            .errors
            .get(serial)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_errors(&self, serial: &str) {
        self.core.book.borrow_mut().errors.remove(serial);
    }
}

impl ControllerCore {
    fn ensure_ready(&self, serial: &str, trace_id: &str) -> Result<(), AppError> {
        if serial.trim().is_empty() {
            return Err(AppError::validation("serial is required", trace_id));
        }
        if !self.dispatcher.is_running() {
            return Err(AppError::usage("Dispatcher is not running", trace_id));
        }
        Ok(())
    }

    fn start_recording(
        self: &Rc<Self>,
        serial: &str,
        options: RecordOptions,
        on_complete: CaptureCallback,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.ensure_ready(serial, &trace_id)?;
        if let Some(session) = self.book.borrow().sessions.get(serial) {
            if session.state.is_active() {
                return Err(AppError::usage(
                    format!("Recording already active for {serial}"),
                    &trace_id,
                ));
            }
        }

        let remote_path = remote_capture_path(&self.record.remote_dir, "screenrecord", serial, "mp4");
        let local_path = self.output_dir.join(remote_file_name(&remote_path));
        let command = screenrecord_command(&options, &remote_path);
        self.book.borrow_mut().sessions.insert(
            serial.to_string(),
            RecordingSession {
                state: CaptureState::Starting,
                trace_id: trace_id.clone(),
                remote_path: remote_path.clone(),
                local_path,
                duration: options.duration,
                process: None,
                reader: None,
                progress: Arc::new(Mutex::new(Vec::new())),
                stop_requested: false,
                auto_stop: None,
                on_complete: Some(on_complete),
            },
        );
        info!(trace_id = %trace_id, serial = %serial, remote_path = %remote_path, "starting screen recording");

        let weak = Rc::downgrade(self);
        let owner = serial.to_string();
        self.dispatcher.schedule(
            (self.adb.clone(), serial.to_string(), command, trace_id),
            |(adb, serial, command, trace_id)| adb.spawn(&serial, &command, &trace_id),
            move |result| {
                if let Some(core) = weak.upgrade() {
                    core.on_record_started(&owner, result);
                }
            },
            false,
        );
        Ok(())
    }

    fn on_record_started(
        self: &Rc<Self>,
        serial: &str,
        result: TaskResult<Box<dyn StreamingProcess>>,
    ) {
        let mut process = match result {
            Ok(process) => process,
            Err(err) => {
                self.finish_recording(serial, Err(err));
                return;
            }
        };

        let (stop_now, duration) = {
            let mut book = self.book.borrow_mut();
            let Some(session) = book.sessions.get_mut(serial) else {
                process.kill();
                return;
            };
            if let Some(stdout) = process.take_stdout() {
                session.reader = Some(spawn_progress_reader(
                    stdout,
                    Arc::clone(&session.progress),
                    session.trace_id.clone(),
                ));
            }
            session.process = Some(process);
            session.state = CaptureState::Recording;
            info!(trace_id = %session.trace_id, serial = %serial, "screen recording started");
            (session.stop_requested, session.duration)
        };

        if stop_now {
            self.stop_recording(serial);
            return;
        }
        if let Some(duration) = duration {
            let weak = Rc::downgrade(self);
            let owner = serial.to_string();
            let timer = self.dispatcher.schedule_after(duration, move || {
                if let Some(core) = weak.upgrade() {
                    debug!(serial = %owner, "recording duration reached");
                    core.stop_recording(&owner);
                }
            });
            if let Some(session) = self.book.borrow_mut().sessions.get_mut(serial) {
                session.auto_stop = timer;
            }
        }
    }

    fn stop_recording(self: &Rc<Self>, serial: &str) -> bool {
        if !self.dispatcher.is_running() {
            self.abandon_recording(serial);
            return false;
        }
        let job = {
            let mut book = self.book.borrow_mut();
            let Some(session) = book.sessions.get_mut(serial) else {
                return false;
            };
            match session.state {
                CaptureState::Starting => {
                    session.stop_requested = true;
                    debug!(trace_id = %session.trace_id, serial = %serial, "stop deferred until recording starts");
                    return true;
                }
                CaptureState::Stopping => return true,
                CaptureState::Recording => {}
                _ => return false,
            }
            session.state = CaptureState::Stopping;
            if let Some(timer) = session.auto_stop.take() {
                self.dispatcher.cancel_timer(timer);
            }
            info!(trace_id = %session.trace_id, serial = %serial, "stopping screen recording");
            StopJob {
                adb: self.adb.clone(),
                serial: serial.to_string(),
                process: session.process.take(),
                reader: session.reader.take(),
                remote_path: session.remote_path.clone(),
                local_path: session.local_path.clone(),
                stop_timeout: Duration::from_millis(self.record.stop_timeout_ms),
                finalize_delay: Duration::from_millis(self.record.finalize_delay_ms),
                trace_id: session.trace_id.clone(),
            }
        };

        let weak = Rc::downgrade(self);
        let owner = serial.to_string();
        self.dispatcher.schedule(
            job,
            finish_stop,
            move |result| {
                if let Some(core) = weak.upgrade() {
                    core.finish_recording(&owner, result);
                }
            },
            false,
        );
        true
    }

    /// Without a dispatcher nothing can stop or pull: kill the local process
    /// and resolve an active session as failed.
    fn abandon_recording(&self, serial: &str) {
        let trace_id = {
            let mut book = self.book.borrow_mut();
            let Some(session) = book.sessions.get_mut(serial) else {
                return;
            };
            if !session.state.is_active() {
                return;
            }
            if let Some(mut process) = session.process.take() {
                process.kill();
            }
            session.reader.take();
            session.auto_stop.take();
            session.trace_id.clone()
        };
        warn!(trace_id = %trace_id, serial = %serial, "dispatcher stopped; recording abandoned");
        self.finish_recording(
            serial,
            Err(AppError::usage(
                "Dispatcher is not running; recording abandoned without pull",
                &trace_id,
            )),
        );
    }

    fn finish_recording(&self, serial: &str, result: TaskResult<StopReport>) {
        let (outcome, callback) = {
            let mut guard = self.book.borrow_mut();
            let book = &mut *guard;
            let Some(session) = book.sessions.get_mut(serial) else {
                return;
            };
            let events = session
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let errors = book.errors.entry(serial.to_string()).or_default();
            for event in &events {
                if let RecordProgress::Error { reason } = event {
                    errors.push(format!("screenrecord: {reason}"));
                }
            }
            let frames = events.iter().rev().find_map(|event| match event {
                RecordProgress::Stopped { frames, .. } => Some(*frames),
                _ => None,
            });

            let outcome = match result {
                Ok(report) => {
                    errors.extend(report.notes);
                    session.state = CaptureState::Completed;
                    info!(
                        trace_id = %session.trace_id,
                        serial = %serial,
                        size_bytes = report.size_bytes,
                        "screen recording saved"
                    );
                    CaptureOutcome {
                        serial: serial.to_string(),
                        result: CaptureResult::Success,
                        detail: CaptureDetail::Video {
                            path: session.local_path.clone(),
                            size_bytes: report.size_bytes,
                            frames,
                        },
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(trace_id = %session.trace_id, serial = %serial, error = %err, "screen recording failed");
                    errors.push(err.error.clone());
                    session.state = CaptureState::Failed;
                    CaptureOutcome::failure(serial, err.error)
                }
            };
            (outcome, session.on_complete.take())
        };
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    fn queue_screen_capture(
        self: &Rc<Self>,
        serial: &str,
        on_complete: CaptureCallback,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.ensure_ready(serial, &trace_id)?;
        debug!(trace_id = %trace_id, serial = %serial, "queueing screenshot");

        let weak = Rc::downgrade(self);
        let owner = serial.to_string();
        self.dispatcher.schedule(
            (
                self.adb.clone(),
                serial.to_string(),
                self.screenshot.clone(),
                trace_id,
            ),
            |(adb, serial, settings, trace_id)| capture_screenshot(&adb, &serial, &settings, &trace_id),
            move |result| {
                if let Some(core) = weak.upgrade() {
                    core.finish_screenshot(&owner, result, on_complete);
                }
            },
            false,
        );
        Ok(())
    }

    fn finish_screenshot(
        &self,
        serial: &str,
        result: TaskResult<DynamicImage>,
        on_complete: CaptureCallback,
    ) {
        let outcome = {
            let mut book = self.book.borrow_mut();
            match result {
                Ok(image) => {
                    let (width, height) = (image.width(), image.height());
                    // Replacing drops the previous image.
                    book.screenshot = Some(HeldScreenshot {
                        serial: serial.to_string(),
                        image,
                    });
                    CaptureOutcome {
                        serial: serial.to_string(),
                        result: CaptureResult::Success,
                        detail: CaptureDetail::Screenshot { width, height },
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(trace_id = %err.trace_id, serial = %serial, error = %err, "screenshot failed");
                    book.errors
                        .entry(serial.to_string())
                        .or_default()
                        .push(err.error.clone());
                    CaptureOutcome::failure(serial, err.error)
                }
            }
        };
        on_complete(outcome);
    }
}

fn spawn_progress_reader(
    stdout: Box<dyn Read + Send>,
    sink: Arc<Mutex<Vec<RecordProgress>>>,
    trace_id: String,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.split(b'\n').map_while(Result::ok) {
            let line = String::from_utf8_lossy(&line);
            if line.trim().is_empty() {
                continue;
            }
            let event = parse_record_line(&line);
            debug!(trace_id = %trace_id, event = ?event, "screenrecord output");
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    })
}

fn wait_for_exit(
    process: &mut dyn StreamingProcess,
    timeout: Duration,
    trace_id: &str,
) -> Result<(), AppError> {
    let start = Instant::now();
    loop {
        if process.try_wait()?.is_some() {
            return Ok(());
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            process.kill();
            return Err(AppError::timeout("screenrecord to exit", elapsed, trace_id));
        }
        thread::sleep(EXIT_POLL);
    }
}

fn join_reader(reader: JoinHandle<()>, trace_id: &str) {
    let deadline = Instant::now() + READER_JOIN_WAIT;
    while !reader.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    if reader.is_finished() {
        let _ = reader.join();
    } else {
        warn!(trace_id = %trace_id, "screenrecord output reader still running; detached");
    }
}

/// Worker side of a stop: interrupt the recorder so it finalizes the file,
/// wait for the local adb process, then pull and clean up.
fn finish_stop(job: StopJob) -> TaskResult<StopReport> {
    let StopJob {
        adb,
        serial,
        mut process,
        reader,
        remote_path,
        local_path,
        stop_timeout,
        finalize_delay,
        trace_id,
    } = job;
    let mut notes = Vec::new();

    if let Err(err) = adb.shell(&serial, &["pkill", "-SIGINT", "screenrecord"], &trace_id) {
        warn!(trace_id = %trace_id, error = %err, "pkill screenrecord failed");
        notes.push(format!("pkill failed: {}", err.error));
    }
    if let Some(process) = process.as_mut() {
        wait_for_exit(&mut **process, stop_timeout, &trace_id)?;
    }
    if let Some(reader) = reader {
        join_reader(reader, &trace_id);
    }
    thread::sleep(finalize_delay);

    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::system(format!("Failed to create output dir: {err}"), &trace_id))?;
    }
    adb.pull(&serial, &remote_path, &local_path, &trace_id)?;
    let size_bytes = fs::metadata(&local_path).map(|meta| meta.len()).unwrap_or(0);
    if size_bytes == 0 {
        return Err(AppError::dependency(
            format!("Pulled recording is empty: {}", local_path.display()),
            &trace_id,
        ));
    }
    if let Err(err) = adb.remove_remote(&serial, &remote_path, &trace_id) {
        warn!(trace_id = %trace_id, error = %err, "failed to remove remote recording");
        notes.push(format!("remote cleanup failed: {}", err.error));
    }
    Ok(StopReport { size_bytes, notes })
}
