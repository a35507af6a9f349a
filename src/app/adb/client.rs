use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::runner::{CommandOutput, ShellRunner, StreamingProcess};
use crate::app::error::AppError;

/// `["-s", serial, rest...]`
pub fn device_args<S: AsRef<str>>(serial: &str, rest: &[S]) -> Vec<String> {
    let mut args = Vec::with_capacity(rest.len() + 2);
    args.push("-s".to_string());
    args.push(serial.to_string());
    args.extend(rest.iter().map(|item| item.as_ref().to_string()));
    args
}

/// Cheap to clone; clones are moved into dispatcher work closures.
#[derive(Clone)]
pub struct Adb {
    program: String,
    runner: Arc<dyn ShellRunner>,
    timeout: Duration,
}

impl Adb {
    pub fn new(program: impl Into<String>, runner: Arc<dyn ShellRunner>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            runner,
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn run(&self, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError> {
        debug!(trace_id = %trace_id, program = %self.program, args = ?args, "running adb");
        self.runner
            .run(&self.program, args, None, self.timeout, trace_id)
    }

    /// Like [`Adb::run`] but a non-zero exit becomes a dependency error.
    pub fn run_checked(
        &self,
        args: &[String],
        what: &str,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let output = self.run(args, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("{what} failed: {}", output.detail()),
                trace_id,
            ));
        }
        Ok(output)
    }

    pub fn devices(&self, trace_id: &str) -> Result<String, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        Ok(self.run_checked(&args, "adb devices", trace_id)?.stdout)
    }

    pub fn connect(&self, address: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        self.run(&["connect".to_string(), address.to_string()], trace_id)
    }

    pub fn disconnect(&self, address: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        self.run_checked(
            &["disconnect".to_string(), address.to_string()],
            "adb disconnect",
            trace_id,
        )
    }

    pub fn shell<S: AsRef<str>>(
        &self,
        serial: &str,
        command: &[S],
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let mut rest = vec!["shell".to_string()];
        rest.extend(command.iter().map(|item| item.as_ref().to_string()));
        let what = format!("adb shell {}", rest[1..].join(" "));
        self.run_checked(&device_args(serial, &rest), &what, trace_id)
    }

    pub fn pull(
        &self,
        serial: &str,
        remote_path: &str,
        local_path: &Path,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let local = local_path.to_string_lossy().to_string();
        let args = device_args(serial, &["pull", remote_path, local.as_str()]);
        self.run_checked(&args, "adb pull", trace_id)
    }

    pub fn remove_remote(&self, serial: &str, remote_path: &str, trace_id: &str) -> Result<(), AppError> {
        self.shell(serial, &["rm", "-f", remote_path], trace_id)
            .map(|_| ())
    }

    pub fn spawn<S: AsRef<str>>(
        &self,
        serial: &str,
        rest: &[S],
        trace_id: &str,
    ) -> Result<Box<dyn StreamingProcess>, AppError> {
        let args = device_args(serial, rest);
        debug!(trace_id = %trace_id, args = ?args, "spawning adb stream");
        self.runner.spawn_streaming(&self.program, &args, trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::FakeShellRunner;

    #[test]
    fn builds_device_scoped_args() {
        assert_eq!(
            device_args("emulator-5554", &["shell", "getprop"]),
            vec!["-s", "emulator-5554", "shell", "getprop"]
        );
    }

    #[test]
    fn run_checked_maps_nonzero_exit_to_dependency_error() {
        let runner = Arc::new(FakeShellRunner::new());
        runner.respond("pull", "", "adb: error: remote object does not exist", 1);
        let adb = Adb::new("adb", runner.clone(), Duration::from_secs(1));

        let err = adb
            .pull("A", "/sdcard/x.mp4", Path::new("/tmp/x.mp4"), "trace-9")
            .expect_err("pull should fail");
        assert_eq!(err.code, crate::app::error::ERR_DEPENDENCY);
        assert!(err.error.contains("remote object does not exist"));
        assert_eq!(err.trace_id, "trace-9");
        assert_eq!(
            runner.calls(),
            vec!["adb -s A pull /sdcard/x.mp4 /tmp/x.mp4".to_string()]
        );
    }

    #[test]
    fn shell_joins_command_into_args() {
        let runner = Arc::new(FakeShellRunner::new());
        runner.respond("getprop", "arm64-v8a\n", "", 0);
        let adb = Adb::new("/opt/adb", runner.clone(), Duration::from_secs(1));
        let output = adb
            .shell("B", &["getprop", "ro.product.cpu.abi"], "t")
            .expect("shell");
        assert_eq!(output.stdout.trim(), "arm64-v8a");
        assert_eq!(
            runner.calls(),
            vec!["/opt/adb -s B shell getprop ro.product.cpu.abi".to_string()]
        );
    }
}
