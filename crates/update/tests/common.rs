//! Shared fixtures for the update integration tests
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::{mpsc, oneshot};
use vigil_common::fs::ReleaseSweep;
use vigil_common::notify::ChannelSink;
use vigil_common::version::marker_bytes;
use vigil_common::{
    NotificationEvent, Notifier, RetryPolicy, Severity, Version, VigilError, VigilResult,
};
use vigil_rendezvous::ClientHandshake;
use vigil_update::{
    ControllableUnit, EmbeddedVersionOracle, NoMount, Timings, UnitRegistry, UpdateContext,
    UpdatePaths,
};

pub const EXECUTABLE: &str = "agent";

/// Executable content: a version marker plus an arbitrary body.
pub fn exe_bytes(version: &str, body: &str) -> Vec<u8> {
    let mut bytes = b"\x7fELF".to_vec();
    bytes.extend_from_slice(&marker_bytes(version));
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

/// In-memory unit. It reports running only while started and while the
/// executable it watches does not contain `BROKEN`.
pub struct FakeUnit {
    name: String,
    exe: Option<PathBuf>,
    running: AtomicBool,
    pub stops: AtomicU32,
    pub starts: AtomicU32,
    failing_stops: AtomicU32,
    failing_starts: AtomicU32,
}

impl FakeUnit {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::build(name, None))
    }

    pub fn watching(name: &str, exe: PathBuf) -> Arc<Self> {
        Arc::new(Self::build(name, Some(exe)))
    }

    fn build(name: &str, exe: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            exe,
            running: AtomicBool::new(true),
            stops: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            failing_stops: AtomicU32::new(0),
            failing_starts: AtomicU32::new(0),
        }
    }

    pub fn fail_next_stops(&self, count: u32) {
        self.failing_stops.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failure(&self, operation: &str) -> VigilError {
        VigilError::Unit {
            unit: self.name.clone(),
            operation: operation.to_string(),
            reason: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl ControllableUnit for FakeUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> VigilResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_starts) {
            return Err(self.failure("start"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> VigilResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_stops) {
            return Err(self.failure("stop"));
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self) -> VigilResult<bool> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let healthy = match &self.exe {
            Some(exe) => fs::read(exe)
                .map(|bytes| !bytes.windows(6).any(|w| w == b"BROKEN"))
                .unwrap_or(false),
            None => true,
        };
        Ok(healthy)
    }
}

/// Unit that keeps an exclusive lock on a file until it is stopped.
pub struct LockHolder {
    name: String,
    held: Mutex<Option<fs::File>>,
    pub stops: AtomicU32,
}

impl LockHolder {
    pub fn holding(name: &str, path: &Path) -> Arc<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap();
        file.lock_exclusive().unwrap();
        Arc::new(Self {
            name: name.to_string(),
            held: Mutex::new(Some(file)),
            stops: AtomicU32::new(0),
        })
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControllableUnit for LockHolder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> VigilResult<()> {
        Ok(())
    }

    async fn stop(&self) -> VigilResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(file) = self.held.lock().unwrap().take() {
            let _ = file.unlock();
        }
        Ok(())
    }

    async fn is_running(&self) -> VigilResult<bool> {
        Ok(self.held.lock().unwrap().is_some())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// A client attaches straight away
    Connect,
    /// Nobody ever attaches
    Silent,
    /// The channel closes without a client
    Close,
}

pub struct ScriptedHandshake {
    script: Script,
    parked: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ScriptedHandshake {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            parked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ClientHandshake for ScriptedHandshake {
    async fn announce(&self) -> VigilResult<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        match self.script {
            Script::Connect => {
                let _ = tx.send(());
            }
            Script::Silent => self.parked.lock().unwrap().push(tx),
            Script::Close => drop(tx),
        }
        Ok(rx)
    }
}

pub struct Fixture {
    pub temp: tempfile::TempDir,
    pub paths: UpdatePaths,
    pub source: PathBuf,
    pub primary: Arc<FakeUnit>,
    pub notifier: Notifier,
    events: mpsc::UnboundedReceiver<NotificationEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let paths = UpdatePaths {
            production_root: root.join("production"),
            staging_dir: root.join("work").join("staging"),
            known_good_dir: root.join("known-good"),
            executable: PathBuf::from(EXECUTABLE),
            excluded: vec![PathBuf::from("logs")],
        };
        let source = root.join("source");
        fs::create_dir_all(&paths.production_root).unwrap();
        fs::create_dir_all(&source).unwrap();

        let primary = FakeUnit::watching("vigil-agent", paths.production_executable());
        let (sink, events) = ChannelSink::new();
        let notifier = Notifier::new(Arc::new(sink)).with_meta("test-run");

        Self {
            temp,
            paths,
            source,
            primary,
            notifier,
            events,
        }
    }

    pub fn production(&self) -> &Path {
        &self.paths.production_root
    }

    pub fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn install(&self, version: &str, body: &str) {
        Self::write(self.production(), EXECUTABLE, &exe_bytes(version, body));
    }

    pub fn publish(&self, version: &str, body: &str) {
        Self::write(&self.source, EXECUTABLE, &exe_bytes(version, body));
    }

    pub fn registry(&self) -> UnitRegistry {
        UnitRegistry::new(self.primary.clone())
    }

    pub fn context(&self, current: &str) -> UpdateContext {
        self.context_with(current, self.registry())
    }

    pub fn context_with(&self, current: &str, units: UnitRegistry) -> UpdateContext {
        UpdateContext {
            paths: self.paths.clone(),
            timings: fast_timings(),
            units,
            mount: Arc::new(NoMount),
            oracle: Arc::new(EmbeddedVersionOracle::with_current(
                current.parse::<Version>().unwrap(),
            )),
            notifier: self.notifier.clone(),
        }
    }

    pub fn events(&mut self) -> Vec<NotificationEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn errors(&mut self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.severity == Severity::Error)
            .map(|e| e.message)
            .collect()
    }
}

pub fn fast_timings() -> Timings {
    let quick = Duration::from_millis(5);
    Timings {
        copy: RetryPolicy::new(2, quick),
        service: RetryPolicy::new(3, quick),
        probe: RetryPolicy::new(3, quick),
        sweep: ReleaseSweep {
            interval: quick,
            max_sweeps: Some(10),
        },
    }
}

/// Snapshot of every file under `root`, for "nothing changed" assertions.
pub fn tree_snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}
