//! One background worker for blocking device work, with completions handed
//! back to the owning thread on `drain()`.
//!
//! The dispatcher is deliberately `!Send`: completion callbacks and timers are
//! stored here, on the thread that created the dispatcher, and are only ever
//! invoked from `drain()`. The worker thread sees nothing but the boxed work
//! closures and returns type-erased results through the completion queue.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::app::config::DispatcherSettings;
use crate::app::error::AppError;

pub type TaskResult<T> = Result<T, AppError>;
pub type TaskId = u64;
pub type TimerId = u64;

type Payload = Box<dyn Any + Send>;
type Job = Box<dyn FnOnce() -> Payload + Send>;
type Callback = Box<dyn FnOnce(Payload)>;

struct QueuedTask {
    id: TaskId,
    job: Job,
}

struct Completion {
    id: TaskId,
    payload: Payload,
}

/// State shared with the worker. The two queues have separate locks so the
/// worker never waits on a drain and a drain never waits on a dequeue.
struct Shared {
    tasks: Mutex<VecDeque<QueuedTask>>,
    wake: Condvar,
    completions: Mutex<Vec<Completion>>,
    shutdown: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct Worker {
    join: JoinHandle<()>,
    exited: mpsc::Receiver<()>,
}

struct Timer {
    id: TimerId,
    due: Instant,
    action: Box<dyn FnOnce()>,
}

pub struct TaskDispatcher {
    shared: Arc<Shared>,
    lifecycle: Cell<Lifecycle>,
    worker: RefCell<Option<Worker>>,
    callbacks: RefCell<HashMap<TaskId, Callback>>,
    timers: RefCell<Vec<Timer>>,
    next_id: Cell<u64>,
    shutdown_timeout: Duration,
    poll_interval: Duration,
}

impl TaskDispatcher {
    pub fn new(settings: &DispatcherSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                completions: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
            lifecycle: Cell::new(Lifecycle::Idle),
            worker: RefCell::new(None),
            callbacks: RefCell::new(HashMap::new()),
            timers: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }

    /// Spawns the worker. A dispatcher starts once; a second call (or a call
    /// after shutdown) is a usage error.
    pub fn start(&self) -> Result<(), AppError> {
        match self.lifecycle.get() {
            Lifecycle::Running => return Err(AppError::usage("Dispatcher already started", "")),
            Lifecycle::Stopped => {
                return Err(AppError::usage("Dispatcher cannot be restarted after shutdown", ""))
            }
            Lifecycle::Idle => {}
        }

        let shared = Arc::clone(&self.shared);
        let (exited_tx, exited_rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("greentea-dispatcher".to_string())
            .spawn(move || {
                worker_loop(&shared);
                let _ = exited_tx.send(());
            })
            .map_err(|err| AppError::system(format!("Failed to spawn dispatcher worker: {err}"), ""))?;

        *self.worker.borrow_mut() = Some(Worker {
            join,
            exited: exited_rx,
        });
        self.lifecycle.set(Lifecycle::Running);
        debug!("dispatcher started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Running
    }

    /// Tasks scheduled but whose completion has not been delivered yet.
    pub fn pending(&self) -> usize {
        self.callbacks.borrow().len()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Queues `work(input)` for the worker and `on_complete(result)` for the
    /// next drain after it finishes. With `immediate`, both run right here on
    /// the calling thread before this returns.
    ///
    /// Returns `None` (and logs) when the dispatcher is not running; the task
    /// is dropped and `on_complete` never runs.
    pub fn schedule<I, O, W, C>(
        &self,
        input: I,
        work: W,
        on_complete: C,
        immediate: bool,
    ) -> Option<TaskId>
    where
        I: Send + 'static,
        O: Send + 'static,
        W: FnOnce(I) -> TaskResult<O> + Send + 'static,
        C: FnOnce(TaskResult<O>) + 'static,
    {
        if !self.is_running() {
            warn!(state = ?self.lifecycle.get(), "dispatcher not running; task ignored");
            return None;
        }
        let id = self.next_id();

        if immediate {
            on_complete(run_guarded(work, input));
            return Some(id);
        }

        self.callbacks.borrow_mut().insert(
            id,
            Box::new(move |payload: Payload| {
                let result = match payload.downcast::<TaskResult<O>>() {
                    Ok(result) => *result,
                    Err(_) => Err(AppError::system("Task result had an unexpected type", "")),
                };
                on_complete(result);
            }),
        );

        let job: Job = Box::new(move || Box::new(run_guarded(work, input)) as Payload);
        lock(&self.shared.tasks).push_back(QueuedTask { id, job });
        self.shared.wake.notify_one();
        Some(id)
    }

    /// Runs `action` on a later drain, once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, action: impl FnOnce() + 'static) -> Option<TimerId> {
        if !self.is_running() {
            warn!("dispatcher not running; timer ignored");
            return None;
        }
        let id = self.next_id();
        self.timers.borrow_mut().push(Timer {
            id,
            due: Instant::now() + delay,
            action: Box::new(action),
        });
        Some(id)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|timer| timer.id != id);
        timers.len() != before
    }

    /// Delivers finished completions in enqueue order, then fires due timers.
    /// Returns how many callbacks and timers ran.
    pub fn drain(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let batch = std::mem::take(&mut *lock(&self.shared.completions));
        let mut invoked = 0;
        for completion in batch {
            // A callback may shut the dispatcher down; the rest is discarded.
            if !self.is_running() {
                break;
            }
            let callback = self.callbacks.borrow_mut().remove(&completion.id);
            if let Some(callback) = callback {
                callback(completion.payload);
                invoked += 1;
            }
        }

        if !self.is_running() {
            return invoked;
        }
        let now = Instant::now();
        let mut due = {
            let mut timers = self.timers.borrow_mut();
            let (due, waiting): (Vec<Timer>, Vec<Timer>) =
                timers.drain(..).partition(|timer| timer.due <= now);
            *timers = waiting;
            due
        };
        due.sort_by_key(|timer| (timer.due, timer.id));
        for timer in due {
            if !self.is_running() {
                break;
            }
            (timer.action)();
            invoked += 1;
        }
        invoked
    }

    /// Drains every `poll_interval` until `condition` holds. Exceeding
    /// `timeout` is a timeout error naming `description`.
    pub fn wait_until(
        &self,
        description: &str,
        timeout: Duration,
        mut condition: impl FnMut() -> bool,
    ) -> Result<(), AppError> {
        let start = Instant::now();
        loop {
            self.drain();
            if condition() {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(AppError::timeout(description, elapsed, ""));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Stops the worker and discards everything queued. Work already running
    /// may finish, but its completion is dropped. A worker that does not exit
    /// within the configured timeout is reported as an error.
    pub fn shutdown(&self) -> Result<(), AppError> {
        if self.lifecycle.get() != Lifecycle::Running {
            return Ok(());
        }
        self.lifecycle.set(Lifecycle::Stopped);
        {
            let mut tasks = lock(&self.shared.tasks);
            self.shared.shutdown.store(true, Ordering::SeqCst);
            tasks.clear();
        }
        self.shared.wake.notify_all();

        let result = match self.worker.borrow_mut().take() {
            Some(worker) => {
                let start = Instant::now();
                match worker.exited.recv_timeout(self.shutdown_timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = worker.join.join();
                        Ok(())
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let elapsed = start.elapsed();
                        error!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            "dispatcher worker did not exit in time; thread leaked"
                        );
                        Err(AppError::timeout("dispatcher worker to exit", elapsed, ""))
                    }
                }
            }
            None => Ok(()),
        };

        lock(&self.shared.completions).clear();
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        debug!(
            dropped_callbacks = callbacks.len(),
            dropped_timers = timers.len(),
            "dispatcher stopped"
        );
        result
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "dispatcher shutdown on drop failed");
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut tasks = lock(&shared.tasks);
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                tasks = shared
                    .wake
                    .wait(tasks)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(task) = task else {
            return;
        };

        let payload = (task.job)();
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        lock(&shared.completions).push(Completion {
            id: task.id,
            payload,
        });
    }
}

fn run_guarded<I, O>(work: impl FnOnce(I) -> TaskResult<O>, input: I) -> TaskResult<O> {
    match catch_unwind(AssertUnwindSafe(move || work(input))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(AppError::system(format!("Task panicked: {message}"), ""))
        }
    }
}
