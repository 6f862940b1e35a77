mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{exe_bytes, tree_snapshot, FakeUnit, Fixture, LockHolder, Script, ScriptedHandshake, EXECUTABLE};
use vigil_common::fs::digest;
use vigil_common::{Severity, Version, VigilError};
use vigil_update::{
    ControllableUnit, SkipReason, UnitRegistry, UpdateOrchestrator, UpdateOutcome, UpdatePhase,
    UpdateRequest, UpdateSource,
};

fn local_request(fx: &Fixture) -> UpdateRequest {
    UpdateRequest::new(UpdateSource::Local(fx.source.clone()))
}

#[tokio::test]
async fn newer_bundle_is_swapped_in() {
    let mut fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    Fixture::write(fx.production(), "plugins/net.so", b"net-old");
    fx.publish("2.1.0.0", "new");
    Fixture::write(&fx.source, "plugins/net.so", b"net-new");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    match &outcome {
        UpdateOutcome::Updated { from, to } => {
            assert_eq!(*from, Version::new(2, 0, 5, 0));
            assert_eq!(*to, Version::new(2, 1, 0, 0));
        }
        other => panic!("unexpected outcome: {}", other),
    }
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(orchestrator.phase(), UpdatePhase::Done);

    assert_eq!(
        digest(&fx.paths.production_executable()).unwrap(),
        digest(&fx.source.join(EXECUTABLE)).unwrap()
    );
    assert_eq!(
        std::fs::read(fx.production().join("plugins/net.so")).unwrap(),
        b"net-new"
    );
    assert!(!fx.paths.staging_dir.exists());
    assert_eq!(
        std::fs::read(fx.paths.known_good_executable()).unwrap(),
        common::exe_bytes("2.0.5.0", "old")
    );
    assert_eq!(fx.primary.stop_count(), 1);
    assert!(fx.primary.is_running().await.unwrap());
    assert!(fx.errors().is_empty());
}

#[tokio::test]
async fn client_timeout_aborts_without_touching_files() {
    let mut fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    fx.publish("2.1.0.0", "new");
    let before = tree_snapshot(fx.production());

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Silent));
    let request = local_request(&fx).with_client_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let outcome = orchestrator.run(&request).await;
    let elapsed = started.elapsed();

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted {
            phase: UpdatePhase::AwaitingClient,
            error: VigilError::ClientTimeout { .. }
        }
    ));
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(!fx.paths.staging_dir.exists());
    assert_eq!(tree_snapshot(fx.production()), before);
    assert_eq!(fx.primary.stop_count(), 0);

    let events = fx.events();
    assert!(events
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("No client connected")));
    assert!(
        events.iter().all(|e| e.severity != Severity::Error),
        "timeout reported as an error: {:?}",
        events
    );
}

#[tokio::test]
async fn closed_handshake_aborts() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    fx.publish("2.1.0.0", "new");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Close));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted {
            error: VigilError::Handshake { .. },
            ..
        }
    ));
    assert_eq!(outcome.exit_code(), 1);
    assert!(!fx.paths.staging_dir.exists());
}

#[tokio::test]
async fn identical_bundle_is_a_no_op_every_time() {
    let fx = Fixture::new();
    fx.install("2.1.0.0", "same");
    Fixture::write(fx.production(), "plugins/net.so", b"net");
    fx.publish("2.1.0.0", "same");
    Fixture::write(&fx.source, "plugins/net.so", b"net");
    let before = tree_snapshot(fx.production());

    for _ in 0..2 {
        let mut orchestrator =
            UpdateOrchestrator::new(fx.context("2.1.0.0"), ScriptedHandshake::new(Script::Connect));
        let outcome = orchestrator.run(&local_request(&fx)).await;
        assert!(matches!(
            outcome,
            UpdateOutcome::Skipped(SkipReason::NoUpdateRequired)
        ));
        assert_eq!(outcome.exit_code(), 0);
        assert!(!fx.paths.staging_dir.exists());
    }

    assert_eq!(tree_snapshot(fx.production()), before);
    assert_eq!(fx.primary.stop_count(), 0);
    assert!(!fx.paths.known_good_dir.exists());
}

#[tokio::test]
async fn already_installed_files_are_not_copied_again() {
    let fx = Fixture::new();
    // The updater itself is older than what production already runs.
    fx.install("2.1.0.0", "same");
    fx.publish("2.1.0.0", "same");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.0.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Skipped(SkipReason::FilesIdentical)
    ));
    assert_eq!(fx.primary.stop_count(), 0);
}

#[tokio::test]
async fn same_version_with_different_content_is_applied() {
    let fx = Fixture::new();
    fx.install("2.1.0.0", "hotfix-1");
    fx.publish("2.1.0.0", "hotfix-2");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.1.0.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
    assert_eq!(
        std::fs::read(fx.paths.production_executable()).unwrap(),
        common::exe_bytes("2.1.0.0", "hotfix-2")
    );
}

#[tokio::test]
async fn older_bundle_is_rejected_unless_downgrades_are_allowed() {
    let mut fx = Fixture::new();
    fx.install("2.1.0.0", "current");
    fx.publish("2.0.0.0", "previous");
    let before = tree_snapshot(fx.production());

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.1.0.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;
    assert!(matches!(outcome, UpdateOutcome::Rejected { .. }));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(tree_snapshot(fx.production()), before);
    assert!(!fx.paths.staging_dir.exists());
    assert_eq!(fx.primary.stop_count(), 0);

    let events = fx.events();
    assert!(events
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("rejected")));
    assert!(
        events.iter().all(|e| e.severity != Severity::Error),
        "rejection reported as an error: {:?}",
        events
    );

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.1.0.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator
        .run(&local_request(&fx).with_allow_downgrade(true))
        .await;
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
    assert_eq!(
        std::fs::read(fx.paths.production_executable()).unwrap(),
        common::exe_bytes("2.0.0.0", "previous")
    );
}

#[tokio::test]
async fn missing_source_aborts_during_staging() {
    let mut fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    let before = tree_snapshot(fx.production());

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let request = UpdateRequest::new(UpdateSource::Local(fx.temp.path().join("nowhere")));
    let outcome = orchestrator.run(&request).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted {
            phase: UpdatePhase::Staging,
            error: VigilError::CopyFailed { .. }
        }
    ));
    assert_eq!(tree_snapshot(fx.production()), before);
    assert_eq!(fx.primary.stop_count(), 0);
    assert!(!fx.errors().is_empty());
}

#[tokio::test]
async fn unreachable_share_aborts_during_staging() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "old");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let request = UpdateRequest::new(UpdateSource::parse("//fileserver/vigil-updates"));
    let outcome = orchestrator.run(&request).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Aborted {
            phase: UpdatePhase::Staging,
            error: VigilError::Mount { .. }
        }
    ));
}

#[tokio::test]
async fn unhealthy_build_is_rolled_back() {
    let mut fx = Fixture::new();
    fx.install("2.0.5.0", "good");
    fx.publish("2.1.0.0", "BROKEN build");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(
        outcome,
        UpdateOutcome::Recovered {
            error: VigilError::UnitsNotRunning { .. }
        }
    ));
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(orchestrator.phase(), UpdatePhase::Recovering);
    assert_eq!(
        digest(&fx.paths.production_executable()).unwrap(),
        digest(&fx.paths.known_good_executable()).unwrap()
    );
    assert!(fx.primary.is_running().await.unwrap());
    assert!(!fx.errors().is_empty());
}

#[tokio::test]
async fn service_that_never_starts_fails_recovery() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "good");
    fx.publish("2.1.0.0", "new");
    fx.primary.fail_next_starts(100);

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    match outcome {
        UpdateOutcome::RecoveryFailed {
            error,
            recovery_error,
        } => {
            assert!(matches!(error, VigilError::Unit { .. }));
            assert!(matches!(
                recovery_error,
                VigilError::UnitStart { attempts: 3, .. }
            ));
        }
        other => panic!("unexpected outcome: {}", other),
    }
    // The known-good executable is back even though the service is down.
    assert_eq!(
        digest(&fx.paths.production_executable()).unwrap(),
        digest(&fx.paths.known_good_executable()).unwrap()
    );
}

#[tokio::test]
async fn auxiliaries_follow_their_roles() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    fx.publish("2.1.0.0", "new");

    let tray = FakeUnit::new("tray");
    let watchdog = FakeUnit::new("watchdog");
    let units: UnitRegistry = fx
        .registry()
        .with_auxiliary(tray.clone() as Arc<dyn ControllableUnit>, true, true)
        .with_auxiliary(watchdog.clone() as Arc<dyn ControllableUnit>, true, false);

    let mut orchestrator = UpdateOrchestrator::new(
        fx.context_with("2.0.5.0", units),
        ScriptedHandshake::new(Script::Connect),
    );
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
    assert_eq!(tray.stop_count(), 1);
    assert!(tray.is_started());
    assert_eq!(watchdog.stop_count(), 1);
    assert_eq!(watchdog.start_count(), 0);
}

#[tokio::test]
async fn leftover_staging_content_never_reaches_production() {
    let mut fx = Fixture::new();
    fx.install("2.0.5.0", "old");
    fx.publish("2.1.0.0", "new");
    // Left behind by a rolled-back bundle that shipped an extra plugin.
    Fixture::write(&fx.paths.staging_dir, EXECUTABLE, &exe_bytes("2.0.9.0", "rolled back"));
    Fixture::write(&fx.paths.staging_dir, "plugins/legacy.so", b"legacy");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(matches!(outcome, UpdateOutcome::Updated { .. }), "{}", outcome);
    assert!(!fx.production().join("plugins/legacy.so").exists());
    assert!(!fx.production().join("plugins").exists());
    assert_eq!(
        std::fs::read(fx.paths.production_executable()).unwrap(),
        exe_bytes("2.1.0.0", "new")
    );
    assert!(fx
        .events()
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("already exists")));
}

#[tokio::test]
async fn failed_copy_into_production_is_rolled_back() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "good");
    // A directory where the bundle ships a file: the copy cannot land.
    Fixture::write(fx.production(), "plugins/net.so/state", b"x");
    fx.publish("2.1.0.0", "new");
    Fixture::write(&fx.source, "plugins/net.so", b"net-new");

    let mut orchestrator =
        UpdateOrchestrator::new(fx.context("2.0.5.0"), ScriptedHandshake::new(Script::Connect));
    let outcome = orchestrator.run(&local_request(&fx)).await;

    match &outcome {
        UpdateOutcome::Recovered {
            error: VigilError::CopyFailed { attempts, .. },
        } => assert_eq!(*attempts, 2),
        other => panic!("unexpected outcome: {}", other),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(
        digest(&fx.paths.production_executable()).unwrap(),
        digest(&fx.paths.known_good_executable()).unwrap()
    );
    assert_eq!(
        std::fs::read(fx.paths.production_executable()).unwrap(),
        exe_bytes("2.0.5.0", "good")
    );
    assert!(fx.primary.is_running().await.unwrap());
}

#[tokio::test]
async fn file_still_locked_after_quiesce_is_rolled_back() {
    let fx = Fixture::new();
    fx.install("2.0.5.0", "good");
    fx.publish("2.1.0.0", "new");

    // Not part of the quiesce set, so it keeps its lock through the swap.
    let indexer = LockHolder::holding("indexer", &fx.production().join("state.db"));
    let units = fx
        .registry()
        .with_auxiliary(indexer.clone() as Arc<dyn ControllableUnit>, false, false);

    let mut orchestrator = UpdateOrchestrator::new(
        fx.context_with("2.0.5.0", units),
        ScriptedHandshake::new(Script::Connect),
    );
    let outcome = orchestrator.run(&local_request(&fx)).await;

    assert!(
        matches!(
            outcome,
            UpdateOutcome::Recovered {
                error: VigilError::FilesLocked { .. }
            }
        ),
        "{}",
        outcome
    );
    // Recovery stops every auxiliary, which frees the file.
    assert_eq!(indexer.stop_count(), 1);
    assert_eq!(
        digest(&fx.paths.production_executable()).unwrap(),
        digest(&fx.paths.known_good_executable()).unwrap()
    );
    assert!(fx.primary.is_running().await.unwrap());
}
