//! Command runner abstraction for executing shell commands.
//!
//! `CommandRunner` is the trait that the store and the upstream source use to
//! execute system commands. `ShellRunner` is the production implementation
//! that spawns `sh -c` under a deadline. `MockRunner` is the test double that
//! records calls and returns preset responses.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::CommandError;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exit status `sh` uses when the program does not exist.
const EXIT_NOT_FOUND: i32 = 127;

/// Trait for executing shell command strings under a deadline.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str, timeout: Duration) -> Result<String, CommandError>;
}

/// Production runner that spawns `sh -c <cmd>`.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str, timeout: Duration) -> Result<String, CommandError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::Spawn {
                command: cmd.to_string(),
                source: e,
            })?;

        // Drain both pipes while waiting so a chatty child cannot block on a
        // full pipe buffer.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_deadline(&mut child, timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                warn!(command = cmd, timeout_ms = timeout.as_millis() as u64, "command timed out");
                return Err(CommandError::Timeout {
                    command: cmd.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => {
                return Err(CommandError::Spawn {
                    command: cmd.to_string(),
                    source: e,
                })
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        debug!(command = cmd, code = ?status.code(), "command finished");

        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).to_string())
        } else if status.code() == Some(EXIT_NOT_FOUND) {
            Err(CommandError::NotFound {
                command: cmd.to_string(),
            })
        } else {
            Err(CommandError::Failed {
                command: cmd.to_string(),
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Poll the child until it exits or the deadline passes (`Ok(None)`).
fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Test-double runner that records commands and returns pre-configured responses.
pub struct MockRunner {
    responses: Mutex<Vec<Result<String, CommandError>>>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn with_responses(responses: Vec<Result<String, CommandError>>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        MockRunner {
            responses: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Queue another response after the ones already scripted.
    pub fn push_response(&self, response: Result<String, CommandError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(0, response);
        }
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, cmd: &str, _timeout: Duration) -> Result<String, CommandError> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(cmd.to_string());
        }
        let popped = self.responses.lock().ok().and_then(|mut r| r.pop());
        popped.unwrap_or_else(|| Ok(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(5);

    #[test]
    fn mock_runner_records_commands() {
        let runner = MockRunner::with_responses(vec![Ok("ok".into()), Ok("ok2".into())]);
        assert!(runner.run("echo hello", T).is_ok());
        assert!(runner.run("echo world", T).is_ok());
        let cmds = runner.executed_commands();
        assert_eq!(cmds, vec!["echo hello".to_string(), "echo world".to_string()]);
    }

    #[test]
    fn mock_runner_returns_responses_in_order() {
        let runner = MockRunner::with_responses(vec![
            Ok("first".into()),
            Err(CommandError::NotFound { command: "x".into() }),
            Ok("third".into()),
        ]);
        assert_eq!(runner.run("cmd1", T).unwrap(), "first");
        assert!(matches!(runner.run("cmd2", T), Err(CommandError::NotFound { .. })));
        assert_eq!(runner.run("cmd3", T).unwrap(), "third");
        assert_eq!(runner.run("cmd4", T).unwrap(), "");
    }

    #[test]
    fn mock_runner_push_appends() {
        let runner = MockRunner::with_responses(vec![Ok("a".into())]);
        runner.push_response(Ok("b".into()));
        assert_eq!(runner.run("1", T).unwrap(), "a");
        assert_eq!(runner.run("2", T).unwrap(), "b");
    }

    #[test]
    fn shell_runner_captures_stdout() {
        let out = ShellRunner.run("printf 'hi there'", T).unwrap();
        assert_eq!(out, "hi there");
    }

    #[test]
    fn shell_runner_reports_failure_with_stderr() {
        let err = ShellRunner.run("echo boom >&2; exit 3", T).unwrap_err();
        match err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn shell_runner_maps_127_to_not_found() {
        let err = ShellRunner
            .run("definitely-not-a-real-binary-usagebar", T)
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[test]
    fn shell_runner_kills_on_timeout() {
        let started = Instant::now();
        let err = ShellRunner
            .run("sleep 5", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
