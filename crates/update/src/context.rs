//! Everything an update or recovery run needs, gathered in one place.

use std::path::PathBuf;
use std::sync::Arc;

use vigil_common::fs::{ReleaseSweep, VerifiedCopier};
use vigil_common::{Notifier, RetryPolicy};

use crate::mount::MountProvider;
use crate::oracle::VersionOracle;
use crate::units::UnitRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePaths {
    pub production_root: PathBuf,
    pub staging_dir: PathBuf,
    pub known_good_dir: PathBuf,
    /// Primary executable, relative to each of the roots above
    pub executable: PathBuf,
    /// Subfolders of the production root the lock sweep skips
    pub excluded: Vec<PathBuf>,
}

impl UpdatePaths {
    pub fn production_executable(&self) -> PathBuf {
        self.production_root.join(&self.executable)
    }

    pub fn staged_executable(&self) -> PathBuf {
        self.staging_dir.join(&self.executable)
    }

    pub fn known_good_executable(&self) -> PathBuf {
        self.known_good_dir.join(&self.executable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub copy: RetryPolicy,
    pub service: RetryPolicy,
    pub probe: RetryPolicy,
    pub sweep: ReleaseSweep,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            copy: RetryPolicy::copy_default(),
            service: RetryPolicy::service_default(),
            probe: RetryPolicy::new(30, std::time::Duration::from_secs(1)),
            sweep: ReleaseSweep::default(),
        }
    }
}

#[derive(Clone)]
pub struct UpdateContext {
    pub paths: UpdatePaths,
    pub timings: Timings,
    pub units: UnitRegistry,
    pub mount: Arc<dyn MountProvider>,
    pub oracle: Arc<dyn VersionOracle>,
    pub notifier: Notifier,
}

impl UpdateContext {
    pub fn copier(&self) -> VerifiedCopier {
        VerifiedCopier::new(self.timings.copy, self.notifier.clone())
    }
}
