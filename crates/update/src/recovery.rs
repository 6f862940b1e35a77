//! Emergency rollback to the known-good executable.
//!
//! Recovery is the last line of defence: its own failures are reported
//! and returned, never recovered from again.

use vigil_common::fs::wait_for_release;
use vigil_common::retry::retry;
use vigil_common::{VigilError, VigilResult};
use tracing::info;

use crate::context::UpdateContext;
use crate::known_good::KnownGoodStore;
use crate::units::UnitHandle;

pub struct RecoveryEngine {
    ctx: UpdateContext,
}

impl RecoveryEngine {
    pub fn new(ctx: UpdateContext) -> Self {
        Self { ctx }
    }

    /// Stops everything, puts the known-good executable back and restarts the primary service.
    pub async fn execute_emergency_recovery(&self) -> VigilResult<()> {
        let ctx = &self.ctx;
        let notifier = &ctx.notifier;
        let paths = &ctx.paths;
        notifier.warn("Starting emergency recovery from the known-good copy");

        self.stop_primary().await?;
        // Every auxiliary, whatever its quiesce role.
        for managed in ctx.units.auxiliaries() {
            if let Err(e) = managed.unit.stop().await {
                notifier.warn(format!("Could not stop {}: {}", managed.unit.name(), e));
            }
        }

        if let Err(e) = wait_for_release(
            &paths.production_root,
            &paths.excluded,
            ctx.timings.sweep,
            notifier,
        )
        .await
        {
            notifier.error(format!("Recovery aborted: {}", e));
            return Err(e);
        }

        let known_good = paths.known_good_executable();
        if !known_good.is_file() {
            notifier.error(format!(
                "Recovery impossible: no known-good executable at {}",
                known_good.display()
            ));
            return Err(VigilError::KnownGoodMissing { path: known_good });
        }

        let target = paths.production_executable();
        ctx.copier()
            .copy_file(&known_good, &target)
            .await
            .into_result(&known_good, &target)?;
        info!("known-good executable restored to {}", target.display());

        let store = KnownGoodStore::new(&paths.known_good_dir, &paths.executable);
        match store.restore_tree(&paths.production_root, &paths.excluded).await {
            Ok(report) if !report.failed.is_empty() => notifier.warn(format!(
                "Restored {} known-good files, {} could not be restored",
                report.copied,
                report.failed.len()
            )),
            Ok(report) => info!("restored {} additional known-good files", report.copied),
            Err(e) => notifier.warn(format!("Known-good tree not restored: {}", e)),
        }

        self.start_primary().await?;
        for unit in ctx.units.restartable_auxiliaries() {
            if let Err(e) = unit.start().await {
                notifier.warn(format!("Could not restart {}: {}", unit.name(), e));
            }
        }

        notifier.info(format!(
            "Recovery complete: {} is running the known-good executable",
            ctx.units.primary().name()
        ));
        Ok(())
    }

    async fn stop_primary(&self) -> VigilResult<()> {
        let primary = self.ctx.units.primary().clone();
        let result = retry(
            self.ctx.timings.service,
            |_| {
                let unit = primary.clone();
                async move { unit.stop().await }
            },
            |attempt, e| self.report_attempt(&primary, "stop", attempt, e),
        )
        .await;

        result.map_err(|exhausted| {
            let err = VigilError::UnitStop {
                unit: primary.name().to_string(),
                attempts: exhausted.attempts,
                last_error: exhausted.last.to_string(),
            };
            self.ctx.notifier.error(format!("Recovery aborted: {}", err));
            err
        })
    }

    async fn start_primary(&self) -> VigilResult<()> {
        let primary = self.ctx.units.primary().clone();
        let result = retry(
            self.ctx.timings.service,
            |_| {
                let unit = primary.clone();
                async move { unit.start().await }
            },
            |attempt, e| self.report_attempt(&primary, "start", attempt, e),
        )
        .await;

        result.map_err(|exhausted| {
            let err = VigilError::UnitStart {
                unit: primary.name().to_string(),
                attempts: exhausted.attempts,
                last_error: exhausted.last.to_string(),
            };
            self.ctx.notifier.error(format!("Recovery failed: {}", err));
            err
        })
    }

    fn report_attempt(&self, unit: &UnitHandle, operation: &str, attempt: u32, error: &VigilError) {
        self.ctx.notifier.warn(format!(
            "Attempt {}/{} to {} {} failed: {}",
            attempt,
            self.ctx.timings.service.max_attempts(),
            operation,
            unit.name(),
            error
        ));
    }
}
