use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use vigil_common::{VigilError, VigilResult};

use super::ControllableUnit;

const STOP_POLL: Duration = Duration::from_millis(100);

/// An auxiliary process spawned by the updater and tracked through a pid file.
#[derive(Debug, Clone)]
pub struct ProcessUnit {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    pid_file: PathBuf,
    stop_timeout: Duration,
}

impl ProcessUnit {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            pid_file: pid_file.into(),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Grace period between the polite and the forced stop.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn failure(&self, operation: &str, reason: impl Into<String>) -> VigilError {
        VigilError::Unit {
            unit: self.name.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    fn recorded_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.pid_file).ok()?;
        raw.trim().parse().ok()
    }

    fn clear_pid_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.pid_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", self.pid_file.display(), e);
            }
        }
    }

    async fn wait_for_exit(&self, pid: u32, grace: Duration) -> VigilResult<bool> {
        let deadline = Instant::now() + grace;
        while platform::is_alive(pid).await? {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        Ok(true)
    }
}

#[async_trait]
impl ControllableUnit for ProcessUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> VigilResult<()> {
        if self.is_running().await? {
            debug!("{} already running", self.name);
            return Ok(());
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.failure("start", format!("{}: {}", self.program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| self.failure("start", "process exited immediately"))?;

        write_pid_file(&self.pid_file, pid)
            .map_err(|e| VigilError::io(Some(self.pid_file.clone()), "write pid file", e))?;
        debug!("{} started with pid {}", self.name, pid);
        // The child outlives this handle; it is tracked through the pid file from here on.
        drop(child);
        Ok(())
    }

    async fn stop(&self) -> VigilResult<()> {
        let Some(pid) = self.recorded_pid() else {
            return Ok(());
        };
        if !platform::is_alive(pid).await? {
            self.clear_pid_file();
            return Ok(());
        }

        platform::terminate(pid)
            .await
            .map_err(|e| self.failure("stop", e))?;
        if !self.wait_for_exit(pid, self.stop_timeout).await? {
            warn!("{} ignored the stop request, killing pid {}", self.name, pid);
            platform::kill(pid).await.map_err(|e| self.failure("stop", e))?;
            if !self.wait_for_exit(pid, self.stop_timeout).await? {
                return Err(self.failure("stop", format!("pid {} is still alive", pid)));
            }
        }
        self.clear_pid_file();
        Ok(())
    }

    async fn is_running(&self) -> VigilResult<bool> {
        match self.recorded_pid() {
            Some(pid) => platform::is_alive(pid).await,
            None => Ok(false),
        }
    }
}

fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", pid))
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    use vigil_common::VigilResult;

    pub(super) async fn is_alive(pid: u32) -> VigilResult<bool> {
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(false);
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => Ok(!is_zombie(pid)),
            // Alive, but owned by someone else.
            Err(Errno::EPERM) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    pub(super) async fn terminate(pid: u32) -> Result<(), String> {
        send(pid, Signal::SIGTERM)
    }

    pub(super) async fn kill(pid: u32) -> Result<(), String> {
        send(pid, Signal::SIGKILL)
    }

    fn send(pid: u32, sig: Signal) -> Result<(), String> {
        let raw = i32::try_from(pid).map_err(|e| e.to_string())?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(format!("{:?} to pid {}: {}", sig, pid, e)),
        }
    }

    /// An exited child nobody has reaped yet still answers signal 0.
    fn is_zombie(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        // The state follows the parenthesised command name, which may itself contain spaces.
        stat.rfind(')')
            .and_then(|end| stat[end + 1..].split_whitespace().next())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(false)
    }
}

#[cfg(windows)]
mod platform {
    use vigil_common::{VigilError, VigilResult};

    use crate::command;

    pub(super) async fn is_alive(pid: u32) -> VigilResult<bool> {
        let argv = vec![
            "tasklist".to_string(),
            "/FI".to_string(),
            format!("PID eq {}", pid),
            "/NH".to_string(),
        ];
        let output = command::run(&argv, &[])
            .await
            .map_err(|e| VigilError::io(None, "tasklist", e))?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing
            .split_whitespace()
            .any(|field| field == pid.to_string()))
    }

    /// Asks the process to close; console processes may ignore it.
    pub(super) async fn terminate(pid: u32) -> Result<(), String> {
        let _ = taskkill(pid, false).await;
        Ok(())
    }

    pub(super) async fn kill(pid: u32) -> Result<(), String> {
        taskkill(pid, true).await
    }

    async fn taskkill(pid: u32, force: bool) -> Result<(), String> {
        let mut argv = vec!["taskkill".to_string(), "/PID".to_string(), pid.to_string()];
        if force {
            argv.push("/F".to_string());
        }
        let output = command::run(&argv, &[]).await.map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command::describe_failure(&output))
        }
    }
}
