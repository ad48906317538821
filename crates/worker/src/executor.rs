//! Command execution with a hard time bound.

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ExecutionError;

/// Captured result of a command that ran to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, absent when a signal ended the process
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: ExitStatus, stdout: String, stderr: String) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            stdout,
            stderr,
        }
    }

    /// Text recorded on the job for a failed run: stderr when there is any,
    /// else a description of how the process ended.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("Command failed with return code {code}"),
            (None, Some(signal)) => format!("Command terminated by signal {signal}"),
            (None, None) => "Command failed".to_string(),
        }
    }
}

/// Runs one command to completion or until `timeout` expires.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError>;
}

impl<F> CommandExecutor for F
where
    F: Fn(&str, Duration) -> Result<CommandOutput, ExecutionError> + Send + Sync,
{
    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        self(command, timeout)
    }
}

/// `sh -c <command>` in its own process group.
///
/// Signals aimed at the worker (terminal Ctrl-C, pool stop) never reach the
/// command. On timeout the whole group is killed, so children started by the
/// shell go with it.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    poll_interval: Duration,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl ShellExecutor {
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn spawn(&self, command: &str) -> std::io::Result<Child> {
        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
    }
}

/// Read `pipe` to EOF on a helper thread; the text arrives on the receiver.
fn drain(pipe: Option<impl Read + Send + 'static>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

/// Drained text, or `None` if the pipe is still open at `deadline`.
///
/// A pipe stays open while any process that inherited it runs, so a
/// backgrounded child keeps this waiting after the shell itself exited.
fn collect(reader: &Receiver<String>, deadline: Instant) -> Option<String> {
    match reader.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(text) => Some(text),
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

/// SIGKILL the process group `pgid`. `false` if no member was left.
fn kill_group(pgid: libc::pid_t) -> bool {
    // SAFETY: kill(2) with a negative pid only sends a signal.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        debug!(pgid, error = %err, "process group already gone");
    }
    rc == 0
}

/// Kill the group led by `child` and reap the leader.
fn kill_and_reap(child: &mut Child) {
    if !kill_group(child.id() as libc::pid_t) {
        let _ = child.kill();
    }
    let _ = child.wait();
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let mut child = self.spawn(command).map_err(ExecutionError::Spawn)?;
        let pgid = child.id() as libc::pid_t;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let deadline = Instant::now() + timeout;
        let timed_out = || ExecutionError::Timeout {
            seconds: timeout.as_secs(),
        };

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    warn!(pid = pgid, timeout = ?timeout, "command timed out, killing process group");
                    kill_and_reap(&mut child);
                    // Readers finish on their own once the group is dead.
                    return Err(timed_out());
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(ExecutionError::Wait(e));
                }
            }
        };

        // The shell is done, but children it left running may still hold
        // the output pipes. They get the rest of the same bound.
        match (collect(&stdout, deadline), collect(&stderr, deadline)) {
            (Some(out), Some(err)) => Ok(CommandOutput::from_status(status, out, err)),
            _ => {
                warn!(pgid, timeout = ?timeout, "command output still open at timeout, killing process group");
                kill_group(pgid);
                Err(timed_out())
            }
        }
    }
}
