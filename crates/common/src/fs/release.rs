//! Waiting for files to be released before they are replaced.
//!
//! An exclusive open (plus an advisory exclusive lock on Unix) is used
//! purely as a probe: the handle is closed straight away.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{VigilError, VigilResult};
use crate::notify::Notifier;

/// Sweep cadence for [`wait_for_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSweep {
    pub interval: Duration,
    /// `None` sweeps until everything is released
    pub max_sweeps: Option<u32>,
}

impl Default for ReleaseSweep {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_sweeps: Some(300),
        }
    }
}

/// One pass over `root`, returning the first file that cannot be exclusively opened.
///
/// `excluded` holds paths relative to `root` whose subtrees are skipped.
/// A missing root has nothing to lock.
pub fn first_locked_file(root: &Path, excluded: &[PathBuf]) -> VigilResult<Option<PathBuf>> {
    if !root.exists() {
        return Ok(None);
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_excluded(root, entry.path(), excluded));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf);
            VigilError::io(path, "scan for locked files", io::Error::other(e.to_string()))
        })?;
        if entry.file_type().is_file() && is_locked(entry.path()) {
            return Ok(Some(entry.path().to_path_buf()));
        }
    }
    Ok(None)
}

/// Sweeps `root` until no file is locked, sleeping `sweep.interval` between passes.
///
/// Returns the number of sweeps that found a lock.
pub async fn wait_for_release(
    root: &Path,
    excluded: &[PathBuf],
    sweep: ReleaseSweep,
    notifier: &Notifier,
) -> VigilResult<u32> {
    let mut blocked = 0;
    loop {
        let locked = {
            let (root, excluded) = (root.to_path_buf(), excluded.to_vec());
            tokio::task::spawn_blocking(move || first_locked_file(&root, &excluded))
                .await
                .map_err(|e| VigilError::io(None, "lock sweep", io::Error::other(e.to_string())))??
        };

        let Some(locked) = locked else {
            debug!("all files under {} released", root.display());
            return Ok(blocked);
        };

        blocked += 1;
        if blocked == 1 {
            notifier.info(format!(
                "Waiting for {} to be released before replacing files",
                locked.display()
            ));
        }
        if let Some(max) = sweep.max_sweeps {
            if blocked >= max {
                notifier.error(format!(
                    "{} is still locked after {} sweeps",
                    locked.display(),
                    blocked
                ));
                return Err(VigilError::FilesLocked {
                    locked,
                    sweeps: blocked,
                });
            }
        }
        tokio::time::sleep(sweep.interval).await;
    }
}

fn is_excluded(root: &Path, path: &Path, excluded: &[PathBuf]) -> bool {
    match path.strip_prefix(root) {
        Ok(relative) => excluded.iter().any(|ex| relative.starts_with(ex)),
        Err(_) => false,
    }
}

fn is_locked(path: &Path) -> bool {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }

    match options.open(path) {
        Ok(file) => !try_exclusive(&file),
        // Vanished between listing and probing: nothing holds it.
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(_) => true,
    }
}

fn try_exclusive(file: &File) -> bool {
    // Dropping the handle releases the lock.
    fs2::FileExt::try_lock_exclusive(file).is_ok()
}
