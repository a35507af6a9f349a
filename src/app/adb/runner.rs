use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stderr when present, stdout otherwise. Device tools are not consistent
    /// about which stream carries the diagnostic.
    pub fn detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// A long-running child whose stdout is consumed line by line
/// (logcat, screenrecord --verbose).
pub trait StreamingProcess: Send {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    fn try_wait(&mut self) -> Result<Option<i32>, AppError>;
    fn kill(&mut self);
}

/// Blocking command execution. Calls may come from the dispatcher worker, so
/// implementations must be shareable across threads.
pub trait ShellRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;

    fn spawn_streaming(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn StreamingProcess>, AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessShellRunner;

impl ShellRunner for ProcessShellRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(program, args, working_dir, timeout, trace_id)
    }

    fn spawn_streaming(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn StreamingProcess>, AppError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                AppError::dependency(format!("Failed to spawn {program}: {err}"), trace_id)
            })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl StreamingProcess for ChildProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> Result<Option<i32>, AppError> {
        match self.child.try_wait() {
            // A signal-terminated child has no code; report it as -1.
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(err) => Err(AppError::system(format!("Failed to poll child: {err}"), "")),
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.kill();
        }
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    let mut child = command
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn command: {err}"), trace_id))?;

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = std::thread::spawn(move || read_to_end_lossy(stdout));
    let stderr_handle = std::thread::spawn(move || read_to_end_lossy(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        &format!("`{program}` to exit"),
                        start.elapsed(),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}

fn read_to_end_lossy(mut reader: impl Read) -> String {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buffer).to_string()
}
