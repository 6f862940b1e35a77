use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use vigil_common::{VigilError, VigilResult};

use super::ControllableUnit;
use crate::command;

const STOP_POLL: Duration = Duration::from_millis(250);

/// Command lines that drive a unit through the host's service manager.
#[derive(Debug, Clone)]
pub struct CommandSet {
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub status: Vec<String>,
    /// When set, the status command's stdout must contain it for the unit to count as running
    pub running_pattern: Option<String>,
    /// How long `stop` waits for the status to report stopped
    pub stop_timeout: Duration,
}

/// A service managed by `systemctl`, `sc.exe` or whatever the commands name.
#[derive(Debug, Clone)]
pub struct ServiceUnit {
    name: String,
    commands: CommandSet,
}

impl ServiceUnit {
    pub fn new(name: impl Into<String>, commands: CommandSet) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }

    fn failure(&self, operation: &str, reason: impl Into<String>) -> VigilError {
        VigilError::Unit {
            unit: self.name.clone(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    async fn invoke(&self, operation: &str, argv: &[String]) -> VigilResult<()> {
        let output = command::run(argv, &[])
            .await
            .map_err(|e| self.failure(operation, e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(operation, command::describe_failure(&output)))
        }
    }
}

#[async_trait]
impl ControllableUnit for ServiceUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> VigilResult<()> {
        if self.is_running().await? {
            debug!("{} already running", self.name);
            return Ok(());
        }
        self.invoke("start", &self.commands.start).await
    }

    async fn stop(&self) -> VigilResult<()> {
        if !self.is_running().await? {
            debug!("{} already stopped", self.name);
            return Ok(());
        }
        self.invoke("stop", &self.commands.stop).await?;

        // Some service managers return before the service has exited.
        let deadline = Instant::now() + self.commands.stop_timeout;
        while self.is_running().await? {
            if Instant::now() >= deadline {
                return Err(self.failure(
                    "stop",
                    format!(
                        "still running {} ms after the stop command",
                        self.commands.stop_timeout.as_millis()
                    ),
                ));
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        Ok(())
    }

    async fn is_running(&self) -> VigilResult<bool> {
        let output = command::run(&self.commands.status, &[])
            .await
            .map_err(|e| self.failure("query", e.to_string()))?;
        Ok(match &self.commands.running_pattern {
            Some(pattern) => String::from_utf8_lossy(&output.stdout).contains(pattern.as_str()),
            None => output.status.success(),
        })
    }
}
