//! # Updater Configuration
//!
//! Settings for a `vigil-updater` invocation, loaded from TOML.
//!
//! ## Configuration Loading
//!
//! The first source that exists wins:
//! 1. An explicit path (`--config`)
//! 2. The `VIGIL_UPDATER_CONFIG` environment variable
//! 3. `vigil-updater.toml` in the working directory
//! 4. Built-in defaults
//!
//! Every section is optional; missing keys fall back to their defaults.
//! Durations are expressed in milliseconds (`*_ms` keys).

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use vigil_common::fs::ReleaseSweep;
use vigil_common::{RetryPolicy, VigilError, VigilResult};

use crate::context::{Timings, UpdatePaths};

pub const CONFIG_ENV: &str = "VIGIL_UPDATER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "vigil-updater.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Production, staging and known-good locations
    pub paths: PathsConfig,

    /// Verified copy and service control retries
    pub retry: RetryConfig,

    /// Post-start health polling
    pub probe: ProbeConfig,

    /// Lock sweep cadence before files are replaced
    pub release: ReleaseConfig,

    /// Readiness and client-connected channel names
    pub rendezvous: RendezvousConfig,

    /// The primary service
    pub service: ServiceConfig,

    /// Auxiliary units stopped and restarted around the swap
    #[serde(rename = "auxiliary")]
    pub auxiliaries: Vec<AuxiliaryConfig>,

    /// Network share mounting
    pub mount: MountConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub production_root: PathBuf,
    pub staging_dir: PathBuf,
    pub known_good_dir: PathBuf,
    /// Primary executable, relative to the production root
    pub executable: PathBuf,
    /// Subfolders of the production root skipped by the lock sweep and the known-good refresh
    pub excluded: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                production_root: PathBuf::from(r"C:\Program Files\Vigil\Agent"),
                staging_dir: PathBuf::from(r"C:\ProgramData\Vigil\staging"),
                known_good_dir: PathBuf::from(r"C:\ProgramData\Vigil\known-good"),
                executable: PathBuf::from("vigil-agent.exe"),
                excluded: vec![PathBuf::from("logs")],
            }
        } else {
            Self {
                production_root: PathBuf::from("/opt/vigil/agent"),
                staging_dir: PathBuf::from("/var/lib/vigil/staging"),
                known_good_dir: PathBuf::from("/var/lib/vigil/known-good"),
                executable: PathBuf::from("vigil-agent"),
                excluded: vec![PathBuf::from("logs")],
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub copy_attempts: u32,
    pub copy_delay_ms: u64,
    pub service_attempts: u32,
    pub service_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            copy_attempts: 5,
            copy_delay_ms: 1_000,
            service_attempts: 3,
            service_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub interval_ms: u64,
    /// `0` sweeps until every file is released
    pub max_sweeps: u32,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_sweeps: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Channel the spawning process listens on
    pub ready_channel: String,
    /// Channel the updater listens on for the observer
    pub connected_channel: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                ready_channel: "vigil-updater-ready".to_string(),
                connected_channel: "vigil-updater-connected".to_string(),
            }
        } else {
            Self {
                ready_channel: "/run/vigil/updater-ready.sock".to_string(),
                connected_channel: "/run/vigil/updater-connected.sock".to_string(),
            }
        }
    }
}

/// Primary service, driven through the host's service manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub start: Vec<String>,
    pub stop: Vec<String>,
    /// Exit status 0 means running, unless `running_pattern` is set
    pub status: Vec<String>,
    /// Substring of the status output that means running
    pub running_pattern: Option<String>,
    pub stop_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                name: "VigilAgent".to_string(),
                start: argv(&["sc.exe", "start", "VigilAgent"]),
                stop: argv(&["sc.exe", "stop", "VigilAgent"]),
                status: argv(&["sc.exe", "query", "VigilAgent"]),
                running_pattern: Some("RUNNING".to_string()),
                stop_timeout_ms: 30_000,
            }
        } else {
            Self {
                name: "vigil-agent".to_string(),
                start: argv(&["systemctl", "start", "vigil-agent"]),
                stop: argv(&["systemctl", "stop", "vigil-agent"]),
                status: argv(&["systemctl", "is-active", "--quiet", "vigil-agent"]),
                running_pattern: None,
                stop_timeout_ms: 30_000,
            }
        }
    }
}

/// An auxiliary unit: either a process the updater spawns itself
/// (`program` + `pid_file`) or a command-driven service (`start`/`stop`/`status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryConfig {
    pub name: String,
    /// Stopped before the swap
    pub quiesce: bool,
    /// Started again after the swap and probed
    pub restart: bool,

    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub pid_file: Option<PathBuf>,

    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub status: Vec<String>,
    pub running_pattern: Option<String>,
    pub stop_timeout_ms: u64,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            quiesce: true,
            restart: true,
            program: None,
            args: Vec::new(),
            pid_file: None,
            start: Vec::new(),
            stop: Vec::new(),
            status: Vec::new(),
            running_pattern: None,
            stop_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount command template; empty means shares must already be reachable as paths.
    /// Placeholders: `{remote}`, `{local}`, `{user}`
    pub mount: Vec<String>,
    pub unmount: Vec<String>,
    /// Parent of the per-share mount points
    pub mount_root: PathBuf,
    /// Environment variable the share password is handed to the mount command in
    pub password_env: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount: Vec::new(),
            unmount: Vec::new(),
            mount_root: std::env::temp_dir().join("vigil-mounts"),
            password_env: "VIGIL_MOUNT_PASSWORD".to_string(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl UpdaterConfig {
    /// Loads the configuration following the documented precedence.
    ///
    /// Returns the config together with the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> VigilResult<(Self, Option<PathBuf>)> {
        let Some(path) = Self::resolve_path(explicit)? else {
            let config = Self::default();
            config.validate().map_err(|errors| VigilError::config(errors.join("; ")))?;
            return Ok((config, None));
        };

        let raw = fs::read_to_string(&path)
            .map_err(|e| VigilError::io(Some(path.clone()), "read configuration", e))?;
        let config = Self::from_toml_str(&raw).map_err(|e| match e {
            VigilError::Config { reason } => {
                VigilError::config(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })?;
        Ok((config, Some(path)))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> VigilResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| VigilError::config(e.to_string()))?;
        config
            .validate()
            .map_err(|errors| VigilError::config(errors.join("; ")))?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> VigilResult<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Self::require_file(path.to_path_buf()).map(Some);
        }
        if let Some(value) = env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Self::require_file(PathBuf::from(value)).map(Some);
        }
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        Ok(local.is_file().then_some(local))
    }

    fn require_file(path: PathBuf) -> VigilResult<PathBuf> {
        if path.is_file() {
            Ok(path)
        } else {
            Err(VigilError::NotFound { path })
        }
    }

    /// Validates the configuration for consistency.
    ///
    /// # Errors
    /// Returns every problem found, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let roots = [
            ("paths.production_root", &self.paths.production_root),
            ("paths.staging_dir", &self.paths.staging_dir),
            ("paths.known_good_dir", &self.paths.known_good_dir),
        ];
        for (key, path) in roots {
            if !path.is_absolute() {
                errors.push(format!("{} must be absolute: {}", key, path.display()));
            }
        }
        for (i, (key_a, a)) in roots.iter().enumerate() {
            for (key_b, b) in roots.iter().skip(i + 1) {
                let (a, b) = (a.clean(), b.clean());
                if a.starts_with(&b) || b.starts_with(&a) {
                    errors.push(format!("{} and {} must not overlap", key_a, key_b));
                }
            }
        }

        if !is_contained_relative(&self.paths.executable) {
            errors.push(format!(
                "paths.executable must be a relative path inside the production root: {}",
                self.paths.executable.display()
            ));
        }
        for excluded in &self.paths.excluded {
            if !is_contained_relative(excluded) {
                errors.push(format!(
                    "paths.excluded entries must be relative subfolders: {}",
                    excluded.display()
                ));
            }
        }

        if self.retry.copy_attempts == 0 {
            errors.push("retry.copy_attempts must be greater than 0".to_string());
        }
        if self.retry.service_attempts == 0 {
            errors.push("retry.service_attempts must be greater than 0".to_string());
        }
        if self.probe.attempts == 0 {
            errors.push("probe.attempts must be greater than 0".to_string());
        }

        if self.rendezvous.ready_channel.trim().is_empty()
            || self.rendezvous.connected_channel.trim().is_empty()
        {
            errors.push("rendezvous channels cannot be empty".to_string());
        } else if self.rendezvous.ready_channel == self.rendezvous.connected_channel {
            errors.push("rendezvous ready and connected channels must differ".to_string());
        }

        if self.service.name.trim().is_empty() {
            errors.push("service.name cannot be empty".to_string());
        }
        for (key, command) in [
            ("service.start", &self.service.start),
            ("service.stop", &self.service.stop),
            ("service.status", &self.service.status),
        ] {
            if command.is_empty() {
                errors.push(format!("{} command cannot be empty", key));
            }
        }

        for aux in &self.auxiliaries {
            if aux.name.trim().is_empty() {
                errors.push("auxiliary.name cannot be empty".to_string());
                continue;
            }
            match (&aux.program, &aux.pid_file) {
                (Some(_), None) => errors.push(format!(
                    "auxiliary '{}' needs a pid_file to track its process",
                    aux.name
                )),
                (Some(_), Some(_)) => {}
                (None, _) => {
                    if aux.start.is_empty() || aux.stop.is_empty() || aux.status.is_empty() {
                        errors.push(format!(
                            "auxiliary '{}' needs either a program or start/stop/status commands",
                            aux.name
                        ));
                    }
                }
            }
        }

        if self.mount.mount.is_empty() != self.mount.unmount.is_empty() {
            errors.push("mount.mount and mount.unmount must be configured together".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn update_paths(&self) -> UpdatePaths {
        UpdatePaths {
            production_root: self.paths.production_root.clean(),
            staging_dir: self.paths.staging_dir.clean(),
            known_good_dir: self.paths.known_good_dir.clean(),
            executable: self.paths.executable.clean(),
            excluded: self.paths.excluded.iter().map(|p| p.clean()).collect(),
        }
    }

    pub fn timings(&self) -> Timings {
        Timings {
            copy: RetryPolicy::new(
                self.retry.copy_attempts,
                Duration::from_millis(self.retry.copy_delay_ms),
            ),
            service: RetryPolicy::new(
                self.retry.service_attempts,
                Duration::from_millis(self.retry.service_delay_ms),
            ),
            probe: RetryPolicy::new(self.probe.attempts, Duration::from_millis(self.probe.delay_ms)),
            sweep: ReleaseSweep {
                interval: Duration::from_millis(self.release.interval_ms),
                max_sweeps: (self.release.max_sweeps > 0).then_some(self.release.max_sweeps),
            },
        }
    }
}

/// Relative, non-empty and never climbing out of its root once cleaned.
fn is_contained_relative(path: &Path) -> bool {
    if path.as_os_str().is_empty() || path.is_absolute() || path.has_root() {
        return false;
    }
    let cleaned = path.clean();
    !matches!(
        cleaned.components().next(),
        Some(Component::ParentDir) | Some(Component::CurDir) | None
    )
}
