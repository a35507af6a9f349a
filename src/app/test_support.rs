//! Scripted stand-ins for adb used by unit tests.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::adb::runner::{CommandOutput, ShellRunner, StreamingProcess};
use crate::app::error::AppError;

struct Rule {
    needle: String,
    output: CommandOutput,
    write_local: Option<Vec<u8>>,
    delay: Option<Duration>,
    once: bool,
}

struct StreamRule {
    needle: String,
    stdout: Vec<u8>,
    exits_on_its_own: bool,
}

#[derive(Default)]
pub struct FakeShellRunner {
    rules: Mutex<Vec<Rule>>,
    streams: Mutex<Vec<StreamRule>>,
    calls: Mutex<Vec<String>>,
    spawned: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rule(&self, rule: Rule) {
        self.rules.lock().expect("rules").push(rule);
    }

    /// Any command line containing `needle` gets this output.
    pub fn respond(&self, needle: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.push_rule(Rule {
            needle: needle.to_string(),
            output: output(stdout, stderr, exit_code),
            write_local: None,
            delay: None,
            once: false,
        });
    }

    /// Consumed by the first matching call; later calls fall through.
    pub fn respond_once(&self, needle: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.push_rule(Rule {
            needle: needle.to_string(),
            output: output(stdout, stderr, exit_code),
            write_local: None,
            delay: None,
            once: true,
        });
    }

    pub fn respond_slowly(&self, needle: &str, stdout: &str, delay: Duration) {
        self.push_rule(Rule {
            needle: needle.to_string(),
            output: output(stdout, "", 0),
            write_local: None,
            delay: Some(delay),
            once: false,
        });
    }

    /// A matching `pull` writes `bytes` to its last argument, like adb would.
    pub fn pull_writes(&self, needle: &str, bytes: &[u8]) {
        self.push_rule(Rule {
            needle: needle.to_string(),
            output: output("1 file pulled.\n", "", 0),
            write_local: Some(bytes.to_vec()),
            delay: None,
            once: false,
        });
    }

    pub fn stream(&self, needle: &str, stdout: &str, exits_on_its_own: bool) {
        self.streams.lock().expect("streams").push(StreamRule {
            needle: needle.to_string(),
            stdout: stdout.as_bytes().to_vec(),
            exits_on_its_own,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(needle))
            .collect()
    }

    /// Kill flags of every streaming process handed out, in spawn order.
    pub fn spawned_kill_flags(&self) -> Vec<Arc<AtomicBool>> {
        self.spawned.lock().expect("spawned").clone()
    }

    fn record(&self, program: &str, args: &[String]) -> String {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().expect("calls").push(line.clone());
        line
    }
}

fn output(stdout: &str, stderr: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(exit_code),
    }
}

impl ShellRunner for FakeShellRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _working_dir: Option<&Path>,
        _timeout: Duration,
        _trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let line = self.record(program, args);
        let matched = {
            let mut rules = self.rules.lock().expect("rules");
            match rules.iter().position(|rule| line.contains(&rule.needle)) {
                Some(index) if rules[index].once => {
                    let rule = rules.remove(index);
                    Some((rule.output, rule.write_local, rule.delay))
                }
                Some(index) => {
                    let rule = &rules[index];
                    Some((rule.output.clone(), rule.write_local.clone(), rule.delay))
                }
                None => None,
            }
        };
        let Some((output, write_local, delay)) = matched else {
            return Ok(output_default());
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let (Some(bytes), Some(local)) = (write_local, args.last()) {
            std::fs::write(local, bytes)
                .map_err(|err| AppError::system(format!("fake pull failed: {err}"), ""))?;
        }
        Ok(output)
    }

    fn spawn_streaming(
        &self,
        program: &str,
        args: &[String],
        trace_id: &str,
    ) -> Result<Box<dyn StreamingProcess>, AppError> {
        let line = self.record(program, args);
        let streams = self.streams.lock().expect("streams");
        let Some(rule) = streams.iter().find(|rule| line.contains(&rule.needle)) else {
            return Err(AppError::dependency(
                format!("no scripted stream for `{line}`"),
                trace_id,
            ));
        };
        let killed = Arc::new(AtomicBool::new(false));
        self.spawned.lock().expect("spawned").push(Arc::clone(&killed));
        Ok(Box::new(FakeStreamingProcess {
            stdout: Some(rule.stdout.clone()),
            exits_on_its_own: rule.exits_on_its_own,
            killed,
        }))
    }
}

fn output_default() -> CommandOutput {
    output("", "", 0)
}

pub struct FakeStreamingProcess {
    stdout: Option<Vec<u8>>,
    exits_on_its_own: bool,
    killed: Arc<AtomicBool>,
}

impl StreamingProcess for FakeStreamingProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> Result<Option<i32>, AppError> {
        if self.exits_on_its_own || self.killed.load(Ordering::SeqCst) {
            Ok(Some(0))
        } else {
            Ok(None)
        }
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}
