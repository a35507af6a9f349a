use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, info};

use crate::app::adb::client::Adb;
use crate::app::dispatcher::{TaskDispatcher, TaskResult};
use crate::app::error::{new_trace_id, AppError};
use crate::app::models::PackageEntry;
use crate::app::text_block::{blocks_with_prefix, get_block, parse_activities, parse_key_values};

const PACKAGE_MARKER: &str = "Package [";
const RESOLVER_MARKER: &str = "Activity Resolver Table:";

/// `Package [com.foo] (4a3b2c):` -> `com.foo`
pub fn package_name_from_header(header: &str) -> Option<&str> {
    let rest = header.trim().strip_prefix(PACKAGE_MARKER)?;
    let (name, _) = rest.split_once(']')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Builds one entry from a `Package [...]` block. A header without body
/// yields an entry with no details.
pub fn parse_package_block<S: AsRef<str>>(block: &[S]) -> Option<PackageEntry> {
    let header = block.first()?.as_ref();
    let name = package_name_from_header(header)?.to_string();
    let body = if block.len() > 1 { &block[1..] } else { &block[0..0] };
    let details = parse_key_values(body);

    let installer = details
        .iter()
        .find(|pair| pair.key == "installerPackageName")
        .map(|pair| pair.value.clone())
        .filter(|value| !value.is_empty() && value != "null");
    let uid = details
        .iter()
        .find(|pair| pair.key == "userId" || pair.key == "appId")
        .and_then(|pair| pair.value.parse().ok());

    Some(PackageEntry {
        name,
        installer,
        uid,
        details,
        raw: block.iter().map(|line| line.as_ref().to_string()).collect(),
    })
}

/// Every package in a `dumpsys package packages` dump, in dump order.
pub fn parse_package_dump(output: &str) -> Vec<PackageEntry> {
    let lines: Vec<&str> = output.lines().collect();
    blocks_with_prefix(&lines, PACKAGE_MARKER)
        .into_iter()
        .filter_map(|block| parse_package_block(block.lines(&lines)))
        .collect()
}

/// Activities of `package` listed in a `dumpsys package <package>` dump.
pub fn parse_package_activities(output: &str, package: &str) -> Vec<String> {
    let lines: Vec<&str> = output.lines().collect();
    parse_activities(get_block(&lines, RESOLVER_MARKER), package)
}

struct PackageListCore {
    dispatcher: Rc<TaskDispatcher>,
    adb: Adb,
    entries: RefCell<Vec<PackageEntry>>,
    serial: RefCell<Option<String>>,
}

/// Installed packages of one device, replaced wholesale on every refresh.
#[derive(Clone)]
pub struct PackageList {
    core: Rc<PackageListCore>,
}

impl PackageList {
    pub fn new(dispatcher: Rc<TaskDispatcher>, adb: Adb) -> Self {
        Self {
            core: Rc::new(PackageListCore {
                dispatcher,
                adb,
                entries: RefCell::new(Vec::new()),
                serial: RefCell::new(None),
            }),
        }
    }

    pub fn entries(&self) -> Vec<PackageEntry> {
        self.core.entries.borrow().clone()
    }

    pub fn get(&self, name: &str) -> Option<PackageEntry> {
        self.core
            .entries
            .borrow()
            .iter()
            .find(|entry| entry.name == name)
            .cloned()
    }

    /// Device the current list came from.
    pub fn serial(&self) -> Option<String> {
        self.core.serial.borrow().clone()
    }

    fn ensure_ready(&self, serial: &str, trace_id: &str) -> Result<(), AppError> {
        if serial.trim().is_empty() {
            return Err(AppError::validation("serial is required", trace_id));
        }
        if !self.core.dispatcher.is_running() {
            return Err(AppError::usage("Dispatcher is not running", trace_id));
        }
        Ok(())
    }

    /// Runs `dumpsys package packages` and replaces the list. On failure the
    /// previous list is kept.
    pub fn refresh(
        &self,
        serial: &str,
        on_refreshed: impl FnOnce(TaskResult<&[PackageEntry]>) + 'static,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.ensure_ready(serial, &trace_id)?;
        debug!(trace_id = %trace_id, serial = %serial, "refreshing package list");

        let weak = Rc::downgrade(&self.core);
        let owner = serial.to_string();
        self.core.dispatcher.schedule(
            (self.core.adb.clone(), serial.to_string(), trace_id),
            |(adb, serial, trace_id)| {
                let output = adb.shell(&serial, &["dumpsys", "package", "packages"], &trace_id)?;
                Ok(parse_package_dump(&output.stdout))
            },
            move |result: TaskResult<Vec<PackageEntry>>| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(entries) => {
                        info!(serial = %owner, count = entries.len(), "package list refreshed");
                        *core.entries.borrow_mut() = entries;
                        *core.serial.borrow_mut() = Some(owner);
                        let entries = core.entries.borrow();
                        on_refreshed(Ok(entries.as_slice()));
                    }
                    Err(err) => on_refreshed(Err(err)),
                }
            },
            false,
        );
        Ok(())
    }

    pub fn query_activities(
        &self,
        serial: &str,
        package: &str,
        on_complete: impl FnOnce(TaskResult<Vec<String>>) + 'static,
    ) -> Result<(), AppError> {
        let trace_id = new_trace_id();
        self.ensure_ready(serial, &trace_id)?;
        if package.trim().is_empty() || package.contains(char::is_whitespace) {
            return Err(AppError::validation("package name is required", &trace_id));
        }

        self.core.dispatcher.schedule(
            (
                self.core.adb.clone(),
                serial.to_string(),
                package.trim().to_string(),
                trace_id,
            ),
            |(adb, serial, package, trace_id)| {
                let output = adb.shell(&serial, &["dumpsys", "package", package.as_str()], &trace_id)?;
                Ok(parse_package_activities(&output.stdout, &package))
            },
            on_complete,
            false,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::DispatcherSettings;
    use crate::app::test_support::FakeShellRunner;
    use crate::app::text_block::FAILED_KEY;
    use std::sync::Arc;
    use std::time::Duration;

    const DUMP: &str = "Packages:
  Package [com.foo] (4a3b2c):
    userId=10123
    pkg=Package{4a3b2c com.foo}
    codePath=/data/app/com.foo-1
    versionCode=3 minSdk=24 targetSdk=34
    installerPackageName=com.android.vending
    requested permissions:
      android.permission.INTERNET
      android.permission.CAMERA
    User 0: ceDataInode=1 installed=true
  Package [com.bar] (1a):
    userId=10124
    installerPackageName=null
  Package [com.empty] (2b):

Shared users:
  SharedUser [android.uid.system]
";

    #[test]
    fn parses_every_package_block() {
        let entries = parse_package_dump(DUMP);
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["com.foo", "com.bar", "com.empty"]);

        let foo = &entries[0];
        assert_eq!(foo.uid, Some(10123));
        assert_eq!(foo.installer.as_deref(), Some("com.android.vending"));
        assert_eq!(foo.detail("targetSdk"), Some("34"));
        assert_eq!(
            foo.detail("requested permissions:"),
            Some("android.permission.INTERNET, android.permission.CAMERA")
        );
        assert_eq!(foo.detail("User 0: ceDataInode"), Some("1"));
        assert_eq!(foo.detail("User 0: installed"), Some("true"));
        assert_eq!(foo.raw.len(), 10);

        assert_eq!(entries[1].installer, None);
        assert!(entries[2].details.is_empty());
        assert_eq!(entries[2].uid, None);
    }

    #[test]
    fn odd_lines_become_failed_details() {
        let entry = parse_package_block(&["Package [com.x] (1):", "    signatures=[abc]", "    Hidden flags"])
            .expect("entry");
        assert_eq!(entry.detail("signatures"), Some("[abc]"));
        assert_eq!(entry.detail(FAILED_KEY), Some("Hidden flags"));
        assert!(parse_package_block(&["not a package"]).is_none());
        assert_eq!(package_name_from_header("  Package [] (1):"), None);
    }

    fn setup() -> (Arc<FakeShellRunner>, Rc<TaskDispatcher>, PackageList) {
        let runner = Arc::new(FakeShellRunner::new());
        let adb = Adb::new("adb", runner.clone(), Duration::from_secs(1));
        let dispatcher = Rc::new(TaskDispatcher::new(&DispatcherSettings::default()));
        dispatcher.start().expect("start");
        let list = PackageList::new(Rc::clone(&dispatcher), adb);
        (runner, dispatcher, list)
    }

    #[test]
    fn refresh_replaces_list_wholesale() {
        let (runner, dispatcher, list) = setup();
        runner.respond_once("dumpsys package packages", DUMP, "", 0);
        runner.respond(
            "dumpsys package packages",
            "Packages:\n  Package [com.only] (9):\n    userId=10200\n",
            "",
            0,
        );

        for expected in [3usize, 1] {
            let seen = Rc::new(RefCell::new(None));
            let sink = Rc::clone(&seen);
            list.refresh("A", move |result| {
                *sink.borrow_mut() = Some(result.expect("refresh").len());
            })
            .expect("scheduled");
            dispatcher
                .wait_until("package refresh", Duration::from_secs(5), || seen.borrow().is_some())
                .expect("refreshed");
            assert_eq!(*seen.borrow(), Some(expected));
        }

        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.get("com.only").expect("entry").uid, Some(10200));
        assert!(list.get("com.foo").is_none());
        assert_eq!(list.serial().as_deref(), Some("A"));
    }

    #[test]
    fn failed_refresh_keeps_previous_list() {
        let (runner, dispatcher, list) = setup();
        runner.respond_once("dumpsys package packages", DUMP, "", 0);
        runner.respond("dumpsys package packages", "", "device offline", 1);

        for _ in 0..2 {
            let done = Rc::new(RefCell::new(None));
            let sink = Rc::clone(&done);
            list.refresh("A", move |result| *sink.borrow_mut() = Some(result.is_ok()))
                .expect("scheduled");
            dispatcher
                .wait_until("package refresh", Duration::from_secs(5), || done.borrow().is_some())
                .expect("finished");
        }
        assert_eq!(list.entries().len(), 3);
    }

    #[test]
    fn queries_activities_of_package() {
        let (runner, dispatcher, list) = setup();
        runner.respond(
            "dumpsys package com.foo",
            "Activity Resolver Table:\n  Non-Data Actions:\n      android.intent.action.MAIN:\n        5d1c8a1 com.foo/.MainActivity filter 9a8b7c6\n        5d1c8a2 com.foo/.UnityPlayerActivity filter 9a8b7c7\n\nKey Set Manager:\n",
            "",
            0,
        );
        let activities = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&activities);

        list.query_activities("A", "com.foo", move |result| {
            *sink.borrow_mut() = Some(result.expect("activities"));
        })
        .expect("scheduled");
        dispatcher
            .wait_until("activities", Duration::from_secs(5), || activities.borrow().is_some())
            .expect("done");

        assert_eq!(
            activities.borrow().clone().expect("list"),
            vec![".MainActivity".to_string(), ".UnityPlayerActivity".to_string()]
        );
        assert!(list.query_activities("A", " ", |_| {}).is_err());
    }
}
