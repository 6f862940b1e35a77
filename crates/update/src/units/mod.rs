//! Units the updater can stop, start and query.

mod process;
mod service;

pub use process::ProcessUnit;
pub use service::{CommandSet, ServiceUnit};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vigil_common::VigilResult;

use crate::config::{AuxiliaryConfig, UpdaterConfig};

#[async_trait]
pub trait ControllableUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Starting a running unit is a no-op.
    async fn start(&self) -> VigilResult<()>;

    /// Returns once the unit is no longer running. Stopping a stopped unit is a no-op.
    async fn stop(&self) -> VigilResult<()>;

    async fn is_running(&self) -> VigilResult<bool>;
}

pub type UnitHandle = Arc<dyn ControllableUnit>;

/// An auxiliary unit and the roles it plays around a swap.
#[derive(Clone)]
pub struct ManagedUnit {
    pub unit: UnitHandle,
    /// Stopped before files are replaced
    pub quiesce: bool,
    /// Started and probed afterwards
    pub restart: bool,
}

/// The primary service plus its auxiliaries.
#[derive(Clone)]
pub struct UnitRegistry {
    primary: UnitHandle,
    auxiliaries: Vec<ManagedUnit>,
}

impl UnitRegistry {
    pub fn new(primary: UnitHandle) -> Self {
        Self {
            primary,
            auxiliaries: Vec::new(),
        }
    }

    pub fn with_auxiliary(mut self, unit: UnitHandle, quiesce: bool, restart: bool) -> Self {
        self.auxiliaries.push(ManagedUnit {
            unit,
            quiesce,
            restart,
        });
        self
    }

    pub fn from_config(config: &UpdaterConfig) -> Self {
        let service = &config.service;
        let primary: UnitHandle = Arc::new(ServiceUnit::new(
            service.name.clone(),
            CommandSet {
                start: service.start.clone(),
                stop: service.stop.clone(),
                status: service.status.clone(),
                running_pattern: service.running_pattern.clone(),
                stop_timeout: Duration::from_millis(service.stop_timeout_ms),
            },
        ));

        config
            .auxiliaries
            .iter()
            .fold(Self::new(primary), |registry, aux| {
                registry.with_auxiliary(auxiliary_unit(aux), aux.quiesce, aux.restart)
            })
    }

    pub fn primary(&self) -> &UnitHandle {
        &self.primary
    }

    pub fn auxiliaries(&self) -> &[ManagedUnit] {
        &self.auxiliaries
    }

    /// Units stopped before the swap, primary first.
    pub fn quiesce_set(&self) -> Vec<UnitHandle> {
        std::iter::once(self.primary.clone())
            .chain(
                self.auxiliaries
                    .iter()
                    .filter(|m| m.quiesce)
                    .map(|m| m.unit.clone()),
            )
            .collect()
    }

    /// Auxiliaries that come back after the swap.
    pub fn restartable_auxiliaries(&self) -> Vec<UnitHandle> {
        self.auxiliaries
            .iter()
            .filter(|m| m.restart)
            .map(|m| m.unit.clone())
            .collect()
    }

    /// Units that must report running after the swap, primary first.
    pub fn restart_set(&self) -> Vec<UnitHandle> {
        std::iter::once(self.primary.clone())
            .chain(self.restartable_auxiliaries())
            .collect()
    }
}

fn auxiliary_unit(aux: &AuxiliaryConfig) -> UnitHandle {
    match (&aux.program, &aux.pid_file) {
        (Some(program), Some(pid_file)) => Arc::new(
            ProcessUnit::new(aux.name.clone(), program.clone(), pid_file.clone())
                .with_args(aux.args.clone())
                .with_stop_timeout(Duration::from_millis(aux.stop_timeout_ms)),
        ),
        _ => Arc::new(ServiceUnit::new(
            aux.name.clone(),
            CommandSet {
                start: aux.start.clone(),
                stop: aux.stop.clone(),
                status: aux.status.clone(),
                running_pattern: aux.running_pattern.clone(),
                stop_timeout: Duration::from_millis(aux.stop_timeout_ms),
            },
        )),
    }
}

/// Names of the given units, for messages.
pub fn unit_names(units: &[UnitHandle]) -> Vec<String> {
    units.iter().map(|u| u.name().to_string()).collect()
}
