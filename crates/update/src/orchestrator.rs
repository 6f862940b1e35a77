//! The update state machine.
//!
//! ```text
//! AwaitingClient -> Staging -> Gating -> Swapping -> CleaningUp -> Done
//!                                           |
//!                                           +-> Failed -> Recovering
//! ```
//!
//! Nothing in production is touched before `Swapping`. Once a unit has
//! been stopped, any failure hands control to the [`RecoveryEngine`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info};
use vigil_common::fs::{prune_extras, wait_for_release};
use vigil_common::{VersionPair, VigilError, VigilResult};
use vigil_rendezvous::ClientHandshake;

use crate::context::UpdateContext;
use crate::gate::{self, GateDecision, RejectReason};
use crate::known_good::KnownGoodStore;
use crate::outcome::{UpdateOutcome, UpdatePhase};
use crate::probe::ServiceProbe;
use crate::recovery::RecoveryEngine;
use crate::request::{UpdateRequest, UpdateSource};
use crate::units::unit_names;

pub struct UpdateOrchestrator {
    ctx: UpdateContext,
    handshake: Arc<dyn ClientHandshake>,
    phase: UpdatePhase,
}

impl UpdateOrchestrator {
    pub fn new(ctx: UpdateContext, handshake: Arc<dyn ClientHandshake>) -> Self {
        Self {
            ctx,
            handshake,
            phase: UpdatePhase::AwaitingClient,
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    fn enter(&mut self, phase: UpdatePhase) {
        debug!("update phase: {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    /// Runs one update invocation to completion.
    pub async fn run(&mut self, request: &UpdateRequest) -> UpdateOutcome {
        self.enter(UpdatePhase::AwaitingClient);
        if let Err(error) = self.await_client(request).await {
            return self.abort(error);
        }

        self.enter(UpdatePhase::Staging);
        self.ctx
            .notifier
            .info(format!("Staging update from {}", request.source));
        if let Err(error) = self.stage(request).await {
            return self.abort(error);
        }

        self.enter(UpdatePhase::Gating);
        let (pair, decision) = match self.gate(request).await {
            Ok(gated) => gated,
            Err(error) => {
                self.remove_staging().await;
                return self.abort(error);
            }
        };
        match decision {
            GateDecision::Skip(reason) => {
                self.ctx
                    .notifier
                    .info(format!("Update skipped: {} (version {})", reason, pair.current));
                self.remove_staging().await;
                self.enter(UpdatePhase::Done);
                return UpdateOutcome::Skipped(reason);
            }
            GateDecision::Reject(RejectReason::VersionTooOld) => {
                self.ctx.notifier.warn(format!(
                    "Update rejected: version {} is older than the installed {}",
                    pair.candidate, pair.current
                ));
                self.remove_staging().await;
                self.enter(UpdatePhase::Failed);
                return UpdateOutcome::Rejected {
                    current: pair.current,
                    candidate: pair.candidate,
                };
            }
            GateDecision::Proceed(reason) => self.ctx.notifier.info(format!(
                "Updating {} -> {} ({})",
                pair.current, pair.candidate, reason
            )),
        }

        self.enter(UpdatePhase::Swapping);
        if let Err(error) = self.refresh_known_good().await {
            // Nothing has been stopped yet.
            return self.abort(error);
        }
        if let Err(error) = self.swap().await {
            return self.recover(error).await;
        }

        self.enter(UpdatePhase::CleaningUp);
        self.remove_staging().await;

        self.enter(UpdatePhase::Done);
        self.ctx.notifier.info(format!(
            "Update to {} completed, {} is running",
            pair.candidate,
            self.ctx.units.primary().name()
        ));
        UpdateOutcome::Updated {
            from: pair.current,
            to: pair.candidate,
        }
    }

    fn abort(&mut self, error: VigilError) -> UpdateOutcome {
        let phase = self.phase;
        // A missing client was already reported as a warning.
        if !matches!(error, VigilError::ClientTimeout { .. }) {
            self.ctx
                .notifier
                .error(format!("Update aborted while {}: {}", phase, error));
        }
        self.enter(UpdatePhase::Failed);
        UpdateOutcome::Aborted { phase, error }
    }

    async fn recover(&mut self, error: VigilError) -> UpdateOutcome {
        self.enter(UpdatePhase::Failed);
        self.ctx
            .notifier
            .error(format!("Update failed during the swap: {}", error));

        self.enter(UpdatePhase::Recovering);
        let engine = RecoveryEngine::new(self.ctx.clone());
        match engine.execute_emergency_recovery().await {
            Ok(()) => UpdateOutcome::Recovered { error },
            Err(recovery_error) => UpdateOutcome::RecoveryFailed {
                error,
                recovery_error,
            },
        }
    }

    async fn await_client(&self, request: &UpdateRequest) -> VigilResult<()> {
        let signal = self.handshake.announce().await?;
        self.ctx.notifier.info("Updater ready, waiting for a client");

        let received = match request.client_deadline() {
            Some(limit) => match timeout(limit, signal).await {
                Ok(received) => received,
                Err(_) => {
                    self.ctx.notifier.warn(format!(
                        "No client connected within {} ms",
                        limit.as_millis()
                    ));
                    return Err(VigilError::ClientTimeout { waited: limit });
                }
            },
            None => signal.await,
        };

        received.map_err(|_| VigilError::Handshake {
            channel: "client-connected".to_string(),
            reason: "channel closed before a client connected".to_string(),
        })?;
        debug!("client connected");
        Ok(())
    }

    async fn stage(&self, request: &UpdateRequest) -> VigilResult<()> {
        let (source_dir, mounted) = match &request.source {
            UpdateSource::Local(path) => (path.clone(), None),
            UpdateSource::Network(remote) => {
                self.ctx
                    .mount
                    .mount(remote, request.credentials.as_ref())
                    .await?;
                (self.ctx.mount.effective_local_path(remote), Some(remote))
            }
        };

        let staged = self.copy_to_staging(&source_dir).await;

        if let Some(remote) = mounted {
            if let Err(e) = self.ctx.mount.unmount(remote).await {
                self.ctx.notifier.warn(format!("Unmount failed: {}", e));
            }
        }
        staged
    }

    async fn copy_to_staging(&self, source_dir: &Path) -> VigilResult<()> {
        let staging = self.ctx.paths.staging_dir.clone();
        let source = source_dir.to_path_buf();
        let prepared = tokio::task::spawn_blocking(move || prepare_staging(&staging, &source))
            .await
            .map_err(|e| VigilError::io(None, "prepare staging", io::Error::other(e.to_string())))??;

        let staging = &self.ctx.paths.staging_dir;
        if let StagingState::Resumed { pruned } = prepared {
            self.ctx.notifier.warn(format!(
                "Staging directory {} already exists, resuming",
                staging.display()
            ));
            if !pruned.is_empty() {
                self.ctx.notifier.warn(format!(
                    "Dropped {} staged entries the new bundle does not contain",
                    pruned.len()
                ));
            }
        }

        self.ctx
            .copier()
            .copy_tree(source_dir, staging, true)
            .await
            .into_result(source_dir, staging)
    }

    async fn gate(&self, request: &UpdateRequest) -> VigilResult<(VersionPair, GateDecision)> {
        let paths = self.ctx.paths.clone();
        let oracle = self.ctx.oracle.clone();
        let (force, allow_downgrade) = (request.force, request.allow_downgrade);

        tokio::task::spawn_blocking(move || -> VigilResult<(VersionPair, GateDecision)> {
            let pair = VersionPair::new(oracle.current(), oracle.candidate(&paths.staged_executable())?);
            debug!("version gate: current {} candidate {}", pair.current, pair.candidate);
            let decision = gate::evaluate(
                pair,
                force,
                allow_downgrade,
                &paths.staged_executable(),
                &paths.production_executable(),
                &paths.staging_dir,
                &paths.production_root,
            )?;
            Ok((pair, decision))
        })
        .await
        .map_err(|e| VigilError::io(None, "gating", io::Error::other(e.to_string())))?
    }

    async fn refresh_known_good(&self) -> VigilResult<()> {
        let paths = &self.ctx.paths;
        let store = KnownGoodStore::new(&paths.known_good_dir, &paths.executable);
        if let Some(report) = store
            .refresh(&paths.production_root, &paths.excluded, &self.ctx.copier())
            .await?
        {
            if !report.failed.is_empty() {
                self.ctx.notifier.warn(format!(
                    "Known-good snapshot skipped {} files",
                    report.failed.len()
                ));
            }
        }
        Ok(())
    }

    /// The critical section. Every error returned from here goes to recovery.
    async fn swap(&self) -> VigilResult<()> {
        let ctx = &self.ctx;
        let paths = &ctx.paths;

        for unit in ctx.units.quiesce_set() {
            ctx.notifier.info(format!("Stopping {}", unit.name()));
            unit.stop().await?;
        }

        wait_for_release(
            &paths.production_root,
            &paths.excluded,
            ctx.timings.sweep,
            &ctx.notifier,
        )
        .await?;

        ctx.copier()
            .copy_tree(&paths.staging_dir, &paths.production_root, true)
            .await
            .into_result(&paths.staging_dir, &paths.production_root)?;

        ctx.notifier
            .info(format!("Starting {}", ctx.units.primary().name()));
        ctx.units.primary().start().await?;
        for unit in ctx.units.restartable_auxiliaries() {
            unit.start().await?;
        }

        let restart_set = ctx.units.restart_set();
        let rounds = ServiceProbe::new(ctx.timings.probe)
            .wait_until_running(&restart_set)
            .await?;
        info!(
            "{} running after {} probes",
            unit_names(&restart_set).join(", "),
            rounds
        );
        Ok(())
    }

    async fn remove_staging(&self) {
        let staging = self.ctx.paths.staging_dir.clone();
        let removal = {
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&staging))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e.to_string())))
        };
        match removal {
            Ok(()) => debug!("removed staging directory {}", staging.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => self.ctx.notifier.warn(format!(
                "Could not remove staging directory {}: {}",
                staging.display(),
                e
            )),
        }
    }
}

enum StagingState {
    Fresh,
    /// Left over from an interrupted run; `pruned` lists what the new source no longer ships.
    Resumed { pruned: Vec<PathBuf> },
}

fn prepare_staging(staging: &Path, source: &Path) -> VigilResult<StagingState> {
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| VigilError::io(Some(parent.to_path_buf()), "create staging parent", e))?;
    }
    match std::fs::create_dir(staging) {
        Ok(()) => Ok(StagingState::Fresh),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // An unreadable source fails the copy below; keep what is staged until then.
            let pruned = if source.is_dir() {
                prune_extras(source, staging)
                    .map_err(|e| VigilError::io(Some(staging.to_path_buf()), "prune staging", e))?
            } else {
                Vec::new()
            };
            Ok(StagingState::Resumed { pruned })
        }
        Err(e) => Err(VigilError::io(
            Some(staging.to_path_buf()),
            "create staging directory",
            e,
        )),
    }
}
