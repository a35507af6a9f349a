use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::client::Adb;
use crate::app::adb::parse::{classify_connect_output, parse_adb_devices, parse_getprop_value, ConnectStatus};
use crate::app::config::DeviceSettings;
use crate::app::dispatcher::{TaskDispatcher, TaskResult};
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::Device;

type DevicesChanged = Box<dyn FnMut(&[Device])>;

#[derive(Default)]
struct DeviceBook {
    devices: Vec<Device>,
    selected: Option<String>,
    last_refresh: Option<Instant>,
    refresh_in_flight: bool,
    last_error: Option<AppError>,
    on_changed: Option<DevicesChanged>,
}

struct ManagerCore {
    dispatcher: Rc<TaskDispatcher>,
    adb: Adb,
    settings: DeviceSettings,
    book: RefCell<DeviceBook>,
}

#[derive(Clone)]
pub struct DeviceConnectionManager {
    core: Rc<ManagerCore>,
}

/// Worker side of a refresh: list devices and fill in the CPU ABI of online
/// devices whose architecture is not already known.
fn list_devices(
    adb: &Adb,
    known: &HashMap<String, String>,
    trace_id: &str,
) -> Result<Vec<Device>, AppError> {
    let mut devices = parse_adb_devices(&adb.devices(trace_id)?);
    for device in devices.iter_mut().filter(|device| device.is_online()) {
        if let Some(architecture) = known.get(&device.id) {
            device.architecture = Some(architecture.clone());
            continue;
        }
        match adb.shell(&device.id, &["getprop", "ro.product.cpu.abi"], trace_id) {
            Ok(output) => device.architecture = parse_getprop_value(&output.stdout),
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %device.id, error = %err, "failed to read device abi");
            }
        }
    }
    Ok(devices)
}

impl DeviceConnectionManager {
    pub fn new(dispatcher: Rc<TaskDispatcher>, adb: Adb, settings: &DeviceSettings) -> Self {
        Self {
            core: Rc::new(ManagerCore {
                dispatcher,
                adb,
                settings: settings.clone(),
                book: RefCell::new(DeviceBook::default()),
            }),
        }
    }

    /// Schedules an `adb devices -l` refresh. Without `force_refresh` calls
    /// within `refresh_interval_sec` of the last refresh are skipped, as are
    /// calls while a refresh is running. Returns whether one was scheduled.
    pub fn update_connected_devices_list(&self, force_refresh: bool) -> bool {
        self.core.update(force_refresh)
    }

    /// Every listed device, whatever its state.
    pub fn devices(&self) -> Vec<Device> {
        self.core.book.borrow().devices.clone()
    }

    /// Devices in the `device` state.
    pub fn connected_devices(&self) -> Vec<Device> {
        self.core
            .book
            .borrow()
            .devices
            .iter()
            .filter(|device| device.is_online())
            .cloned()
            .collect()
    }

    pub fn is_refreshing(&self) -> bool {
        self.core.book.borrow().refresh_in_flight
    }

    pub fn last_error(&self) -> Option<AppError> {
        self.core.book.borrow().last_error.clone()
    }

    pub fn set_on_devices_changed(&self, callback: impl FnMut(&[Device]) + 'static) {
        self.core.book.borrow_mut().on_changed = Some(Box::new(callback));
    }

    pub fn select(&self, id: &str) -> Result<(), AppError> {
        let mut book = self.core.book.borrow_mut();
        if !book.devices.iter().any(|device| device.id == id && device.is_online()) {
            return Err(AppError::validation(
                format!("Device not connected: {id}"),
                new_trace_id(),
            ));
        }
        book.selected = Some(id.to_string());
        Ok(())
    }

    pub fn selected(&self) -> Option<Device> {
        let book = self.core.book.borrow();
        let id = book.selected.as_deref()?;
        book.devices.iter().find(|device| device.id == id).cloned()
    }

    /// `adb connect ip:port`. Text such as `failed to connect ...` counts as
    /// failure even when adb exits with 0. Success forces a list refresh
    /// before `on_complete` runs.
    pub fn connect(
        &self,
        ip: &str,
        port: Option<u16>,
        on_complete: impl FnOnce(TaskResult<String>) + 'static,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        let ip = ip.trim();
        if ip.is_empty() || ip.contains(char::is_whitespace) {
            return Err(AppError::validation("ip is required", &trace_id));
        }
        let address = format!("{ip}:{}", port.unwrap_or(self.core.settings.default_port));
        self.core.ensure_running(&trace_id)?;
        info!(trace_id = %trace_id, address = %address, "connecting device");

        let weak = Rc::downgrade(&self.core);
        self.core.dispatcher.schedule(
            (
                self.core.adb.clone(),
                address,
                self.core.settings.connect_failure_prefixes.clone(),
                trace_id,
            ),
            |(adb, address, prefixes, trace_id)| {
                let output = adb.connect(&address, &trace_id)?;
                match classify_connect_output(&output.stdout, &output.stderr, output.exit_code, &prefixes) {
                    ConnectStatus::Connected { message } => Ok(message),
                    ConnectStatus::Failed { reason } => Err(AppError::dependency(reason, &trace_id)),
                }
            },
            move |result: TaskResult<String>| {
                if let Some(core) = weak.upgrade() {
                    match &result {
                        Ok(_) => {
                            core.update(true);
                        }
                        Err(err) => warn!(trace_id = %err.trace_id, error = %err, "adb connect failed"),
                    }
                }
                on_complete(result);
            },
            false,
        );
        Ok(())
    }

    /// `adb disconnect <id>`; the device leaves the list on success.
    pub fn disconnect(
        &self,
        id: &str,
        on_complete: impl FnOnce(TaskResult<()>) + 'static,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        if id.trim().is_empty() {
            return Err(AppError::validation("device id is required", &trace_id));
        }
        self.core.ensure_running(&trace_id)?;

        let weak = Rc::downgrade(&self.core);
        let owner = id.trim().to_string();
        self.core.dispatcher.schedule(
            (self.core.adb.clone(), owner.clone(), trace_id),
            |(adb, id, trace_id)| adb.disconnect(&id, &trace_id).map(|_| ()),
            move |result: TaskResult<()>| {
                if let Some(core) = weak.upgrade() {
                    if result.is_ok() {
                        core.remove(&owner);
                        core.update(true);
                    }
                }
                on_complete(result);
            },
            false,
        );
        Ok(())
    }
}

impl ManagerCore {
    fn ensure_running(&self, trace_id: &str) -> Result<(), AppError> {
        if !self.dispatcher.is_running() {
            return Err(AppError::usage("Dispatcher is not running", trace_id));
        }
        Ok(())
    }

    fn update(self: &Rc<Self>, force_refresh: bool) -> bool {
        let known = {
            let mut book = self.book.borrow_mut();
            if book.refresh_in_flight {
                return false;
            }
            let interval = Duration::from_secs(self.settings.refresh_interval_sec);
            let fresh = book
                .last_refresh
                .is_some_and(|last| last.elapsed() < interval);
            if fresh && !force_refresh {
                return false;
            }
            if !self.dispatcher.is_running() {
                return false;
            }
            book.refresh_in_flight = true;
            book.devices
                .iter()
                .filter_map(|device| {
                    device
                        .architecture
                        .as_ref()
                        .map(|abi| (device.id.clone(), abi.clone()))
                })
                .collect::<HashMap<_, _>>()
        };

        let trace_id = new_trace_id();
        debug!(trace_id = %trace_id, force_refresh, "refreshing device list");
        let weak = Rc::downgrade(self);
        self.dispatcher.schedule(
            (self.adb.clone(), known, trace_id),
            |(adb, known, trace_id)| list_devices(&adb, &known, &trace_id),
            move |result| {
                if let Some(core) = weak.upgrade() {
                    core.apply(result);
                }
            },
            false,
        );
        true
    }

    fn apply(&self, result: TaskResult<Vec<Device>>) {
        let changed = {
            let mut book = self.book.borrow_mut();
            book.refresh_in_flight = false;
            book.last_refresh = Some(Instant::now());
            match result {
                Ok(devices) => {
                    book.last_error = None;
                    let changed = book.devices != devices;
                    book.devices = devices;
                    let selected_gone = book.selected.as_ref().is_some_and(|id| {
                        !book.devices.iter().any(|device| &device.id == id && device.is_online())
                    });
                    if selected_gone {
                        book.selected = None;
                    }
                    changed
                }
                Err(err) => {
                    warn!(trace_id = %err.trace_id, error = %err, "device refresh failed");
                    book.last_error = Some(err);
                    false
                }
            }
        };
        if changed {
            self.notify_changed();
        }
    }

    fn remove(&self, id: &str) {
        let removed = {
            let mut book = self.book.borrow_mut();
            let before = book.devices.len();
            book.devices.retain(|device| device.id != id);
            if book.selected.as_deref() == Some(id) {
                book.selected = None;
            }
            book.devices.len() != before
        };
        if removed {
            self.notify_changed();
        }
    }

    fn notify_changed(&self) {
        let (callback, devices) = {
            let mut book = self.book.borrow_mut();
            (book.on_changed.take(), book.devices.clone())
        };
        if let Some(mut callback) = callback {
            callback(&devices);
            let mut book = self.book.borrow_mut();
            if book.on_changed.is_none() {
                book.on_changed = Some(callback);
            }
        }
    }
}
