use std::rc::Rc;
use std::sync::Arc;

use tracing::info;

use crate::app::adb::client::Adb;
use crate::app::adb::locator::{resolve_adb_program, ToolPaths};
use crate::app::adb::runner::{ProcessShellRunner, ShellRunner};
use crate::app::capture::DeviceCaptureController;
use crate::app::config::AppConfig;
use crate::app::devices::DeviceConnectionManager;
use crate::app::dispatcher::{TaskDispatcher, TaskResult};
use crate::app::error::{new_trace_id, AppError};
use crate::app::logcat::session::{clear_device_log, resolve_package_pid};
use crate::app::logcat::{LogcatRequest, LogcatSession};
use crate::app::packages::PackageList;

/// Everything a host needs to drive devices from its main thread. The
/// components share one dispatcher and one adb client; dropping the context
/// shuts the dispatcher down.
pub struct AppContext {
    config: AppConfig,
    tool_paths: ToolPaths,
    adb: Adb,
    dispatcher: Rc<TaskDispatcher>,
    devices: DeviceConnectionManager,
    capture: DeviceCaptureController,
    packages: PackageList,
}

impl AppContext {
    /// Resolves adb from the config and environment, spawning real processes.
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let tool_paths = ToolPaths::from_settings_or_env(&config.tools);
        Self::with_runner(config, tool_paths, Arc::new(ProcessShellRunner))
    }

    pub fn with_runner(
        config: AppConfig,
        tool_paths: ToolPaths,
        runner: Arc<dyn ShellRunner>,
    ) -> Result<Self, AppError> {
        let trace_id = new_trace_id();
        let program = resolve_adb_program(&config.tools, &tool_paths, &trace_id)?;
        info!(trace_id = %trace_id, adb = %program, "adb resolved");

        let adb = Adb::new(program, runner, config.tools.command_timeout());
        let dispatcher = Rc::new(TaskDispatcher::new(&config.dispatcher));
        let devices = DeviceConnectionManager::new(Rc::clone(&dispatcher), adb.clone(), &config.device);
        let capture = DeviceCaptureController::new(Rc::clone(&dispatcher), adb.clone(), &config);
        let packages = PackageList::new(Rc::clone(&dispatcher), adb.clone());

        Ok(Self {
            config,
            tool_paths,
            adb,
            dispatcher,
            devices,
            capture,
            packages,
        })
    }

    pub fn start(&self) -> Result<(), AppError> {
        self.dispatcher.start()
    }

    /// Delivers finished work and due timers. Call from the host's update loop.
    pub fn tick(&self) -> usize {
        self.dispatcher.drain()
    }

    pub fn shutdown(&self) -> Result<(), AppError> {
        self.dispatcher.shutdown()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tool_paths(&self) -> &ToolPaths {
        &self.tool_paths
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    pub fn dispatcher(&self) -> &Rc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn devices(&self) -> &DeviceConnectionManager {
        &self.devices
    }

    pub fn capture(&self) -> &DeviceCaptureController {
        &self.capture
    }

    pub fn packages(&self) -> &PackageList {
        &self.packages
    }

    /// Logcat request for `serial` built from the configured format and buffers.
    pub fn logcat_request(&self, serial: &str) -> LogcatRequest {
        LogcatRequest::new(serial, &self.config.logcat)
    }

    pub fn start_logcat(&self, request: &LogcatRequest) -> Result<LogcatSession, AppError> {
        let trace_id = new_trace_id();
        if request.serial.trim().is_empty() {
            return Err(AppError::validation("serial is required", &trace_id));
        }
        LogcatSession::start(&self.adb, request, self.config.logcat.max_entries, &trace_id)
    }

    /// Starts logcat limited to the running process of `package`.
    pub fn start_package_logcat(
        &self,
        serial: &str,
        package: &str,
    ) -> Result<LogcatSession, AppError> {
        let trace_id = new_trace_id();
        let pid = resolve_package_pid(&self.adb, serial, package, &trace_id)?;
        let mut request = self.logcat_request(serial);
        request.pid = Some(pid);
        LogcatSession::start(&self.adb, &request, self.config.logcat.max_entries, &trace_id)
    }

    pub fn clear_device_log(
        &self,
        serial: &str,
        on_complete: impl FnOnce(TaskResult<()>) + 'static,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        if serial.trim().is_empty() {
            return Err(AppError::validation("serial is required", &trace_id));
        }
        if !self.dispatcher.is_running() {
            return Err(AppError::usage("Dispatcher is not running", &trace_id));
        }
        clear_device_log(&self.dispatcher, &self.adb, serial, &trace_id, on_complete);
        Ok(())
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        let _ = self.dispatcher.shutdown();
    }
}
