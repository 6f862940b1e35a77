//! # vigil-update
//!
//! Replaces the agent's binaries in place and rolls back to the
//! known-good copy when the swap goes wrong.
//!
//! The [`UpdateOrchestrator`] drives an invocation from the client
//! handshake through staging, gating and the swap; the
//! [`RecoveryEngine`] takes over on any failure inside the swap.

mod command;
pub mod config;
pub mod context;
pub mod gate;
pub mod known_good;
pub mod mount;
pub mod oracle;
pub mod orchestrator;
pub mod outcome;
pub mod probe;
pub mod recovery;
pub mod request;
pub mod units;

pub use config::UpdaterConfig;
pub use context::{Timings, UpdateContext, UpdatePaths};
pub use gate::{GateDecision, ProceedReason, RejectReason, SkipReason};
pub use mount::{CommandMount, MountProvider, NoMount};
pub use oracle::{EmbeddedVersionOracle, VersionOracle};
pub use orchestrator::UpdateOrchestrator;
pub use outcome::{UpdateOutcome, UpdatePhase};
pub use probe::ServiceProbe;
pub use recovery::RecoveryEngine;
pub use request::{Credentials, UpdateRequest, UpdateSource};
pub use units::{ControllableUnit, ProcessUnit, ServiceUnit, UnitHandle, UnitRegistry};

/// Correlation tag attached to every notification of one invocation.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
