use std::fmt;

use vigil_common::{Version, VigilError};

use crate::gate::SkipReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    AwaitingClient,
    Staging,
    Gating,
    Swapping,
    CleaningUp,
    Done,
    Failed,
    Recovering,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdatePhase::AwaitingClient => "awaiting client",
            UpdatePhase::Staging => "staging",
            UpdatePhase::Gating => "gating",
            UpdatePhase::Swapping => "swapping",
            UpdatePhase::CleaningUp => "cleaning up",
            UpdatePhase::Done => "done",
            UpdatePhase::Failed => "failed",
            UpdatePhase::Recovering => "recovering",
        })
    }
}

/// How an update invocation ended.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated {
        from: Version,
        to: Version,
    },
    Skipped(SkipReason),
    Rejected {
        current: Version,
        candidate: Version,
    },
    /// Failed before any service was stopped
    Aborted {
        phase: UpdatePhase,
        error: VigilError,
    },
    /// The swap failed and the known-good copy is running again
    Recovered {
        error: VigilError,
    },
    RecoveryFailed {
        error: VigilError,
        recovery_error: VigilError,
    },
}

impl UpdateOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateOutcome::Updated { .. } | UpdateOutcome::Skipped(_) => 0,
            UpdateOutcome::Aborted { .. } | UpdateOutcome::Rejected { .. } => 1,
            UpdateOutcome::Recovered { .. } => 2,
            UpdateOutcome::RecoveryFailed { .. } => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::Updated { from, to } => write!(f, "updated {} -> {}", from, to),
            UpdateOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            UpdateOutcome::Rejected { current, candidate } => write!(
                f,
                "rejected: candidate {} is older than {}",
                candidate, current
            ),
            UpdateOutcome::Aborted { phase, error } => {
                write!(f, "aborted while {}: {}", phase, error)
            }
            UpdateOutcome::Recovered { error } => write!(f, "recovered after: {}", error),
            UpdateOutcome::RecoveryFailed {
                error,
                recovery_error,
            } => write!(f, "recovery failed ({}) after: {}", recovery_error, error),
        }
    }
}
