//! Shell tasks run inside a staged variant before it is archived.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::error::{BiddleError, Result};

pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was killed by a signal.
    pub status: Option<i32>,
}

impl TaskOutput {
    /// Anything written to stderr counts as failure, as does a non-zero exit.
    pub fn succeeded(&self) -> bool {
        self.status == Some(0) && self.stderr.trim().is_empty()
    }
}

/// Runs one command line in a working directory. Blocking; sessions call it
/// through `spawn_blocking`.
pub trait TaskRunner: Send + Sync {
    fn run(&self, command_line: &str, cwd: &Path) -> Result<TaskOutput>;
}

/// `sh -c` on Unix, `cmd /C` on Windows, killed after a timeout.
#[derive(Debug, Clone)]
pub struct ShellTaskRunner {
    timeout: Duration,
}

impl Default for ShellTaskRunner {
    fn default() -> Self {
        let secs = std::env::var("BIDDLE_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_TASK_TIMEOUT_SECS);
        ShellTaskRunner::new(Duration::from_secs(secs))
    }
}

impl ShellTaskRunner {
    pub fn new(timeout: Duration) -> Self {
        ShellTaskRunner { timeout }
    }
}

fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill").arg("-9").arg(pid.to_string()).output();
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
}

impl TaskRunner for ShellTaskRunner {
    fn run(&self, command_line: &str, cwd: &Path) -> Result<TaskOutput> {
        let task_error = |reason: String| BiddleError::Task {
            variant: String::new(),
            command: command_line.to_string(),
            reason,
        };
        let child = shell_command(command_line)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| task_error(e.to_string()))?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let output = match rx.recv_timeout(self.timeout) {
            Ok(res) => res.map_err(|e| task_error(e.to_string()))?,
            Err(_) => {
                kill_pid(pid);
                return Err(task_error(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        Ok(TaskOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }
}
