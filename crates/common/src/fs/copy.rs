//! Copy-then-verify with whole-operation retries.
//!
//! A copy may traverse a flaky network path, so every attempt is followed
//! by an independent re-read of source and destination. A truncated or
//! corrupted transfer shows up as a checksum mismatch instead of being
//! silently propagated.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::errors::VigilError;
use crate::fs::checksum::files_equal;
use crate::notify::Notifier;
use crate::retry::RetryPolicy;

const PARTIAL_SUFFIX: &str = "vigil-partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyFailureReason {
    /// Destination file absent after the copy step
    MissingAfterCopy,
    /// Destination differs from source
    ChecksumMismatch,
    /// The copy or the verification could not run
    Io(String),
}

impl fmt::Display for CopyFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyFailureReason::MissingAfterCopy => f.write_str("missing after copy"),
            CopyFailureReason::ChecksumMismatch => f.write_str("checksum mismatch"),
            CopyFailureReason::Io(message) => write!(f, "i/o error: {}", message),
        }
    }
}

/// First offending file of a failed attempt, relative to the copy root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    pub relative_path: PathBuf,
    pub reason: CopyFailureReason,
}

impl CopyFailure {
    fn io(relative_path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self {
            relative_path: relative_path.into(),
            reason: CopyFailureReason::Io(message.to_string()),
        }
    }
}

impl fmt::Display for CopyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.relative_path.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub attempts: u32,
    /// Failure of the last attempt; `None` on success
    pub failure: Option<CopyFailure>,
}

impl CopyOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Converts a failed outcome into [`VigilError::CopyFailed`].
    pub fn into_result(self, from: &Path, to: &Path) -> Result<(), VigilError> {
        match self.failure {
            None => Ok(()),
            Some(failure) => Err(VigilError::CopyFailed {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                attempts: self.attempts,
                failure,
            }),
        }
    }
}

#[derive(Clone)]
pub struct VerifiedCopier {
    policy: RetryPolicy,
    notifier: Notifier,
}

impl VerifiedCopier {
    pub fn new(policy: RetryPolicy, notifier: Notifier) -> Self {
        Self { policy, notifier }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Copies the tree under `source` into `dest`, then verifies every source file.
    ///
    /// With `overwrite == false` existing destination files are kept; they
    /// still have to match the source for the attempt to pass.
    pub async fn copy_tree(&self, source: &Path, dest: &Path, overwrite: bool) -> CopyOutcome {
        self.run(source, dest, move |from, to| {
            copy_tree_once(&from, &to, overwrite)?;
            verify_tree(&from, &to)
        })
        .await
    }

    /// Single-file analogue of [`VerifiedCopier::copy_tree`].
    pub async fn copy_file(&self, source: &Path, dest: &Path) -> CopyOutcome {
        self.run(source, dest, |from, to| {
            let name = from.file_name().map(PathBuf::from).unwrap_or_default();
            if !from.is_file() {
                return Err(CopyFailure::io(name, "source file does not exist"));
            }
            replace_file(&from, &to).map_err(|e| CopyFailure::io(name.clone(), e))?;
            verify_file(&from, &to, name)
        })
        .await
    }

    async fn run<F>(&self, source: &Path, dest: &Path, attempt: F) -> CopyOutcome
    where
        F: Fn(PathBuf, PathBuf) -> Result<(), CopyFailure> + Clone + Send + 'static,
    {
        let max = self.policy.max_attempts();
        let mut current = 1;
        loop {
            let (from, to, step) = (source.to_path_buf(), dest.to_path_buf(), attempt.clone());
            let result = tokio::task::spawn_blocking(move || step(from, to))
                .await
                .unwrap_or_else(|join| Err(CopyFailure::io("", join)));

            let failure = match result {
                Ok(()) => {
                    debug!(
                        "verified copy {} -> {} succeeded on attempt {}",
                        source.display(),
                        dest.display(),
                        current
                    );
                    return CopyOutcome {
                        attempts: current,
                        failure: None,
                    };
                }
                Err(failure) => failure,
            };

            if current >= max {
                self.notifier.error(format!(
                    "Copy from {} to {} failed after {} attempts: {}",
                    source.display(),
                    dest.display(),
                    current,
                    failure
                ));
                return CopyOutcome {
                    attempts: current,
                    failure: Some(failure),
                };
            }

            self.notifier.warn(format!(
                "Copy attempt {}/{} from {} to {} failed: {}. Retrying in {} ms",
                current,
                max,
                source.display(),
                dest.display(),
                failure,
                self.policy.delay.as_millis()
            ));
            tokio::time::sleep(self.policy.delay).await;
            current += 1;
        }
    }
}

/// Checks that every file under `source` exists under `dest` with the same digest.
pub fn verify_tree(source: &Path, dest: &Path) -> Result<(), CopyFailure> {
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CopyFailure::io("", e))?;
        if !entry.path().is_file() {
            continue;
        }
        let relative = relative_to(source, entry.path())?;
        verify_file(entry.path(), &dest.join(&relative), relative)?;
    }
    Ok(())
}

fn verify_file(source: &Path, dest: &Path, relative: PathBuf) -> Result<(), CopyFailure> {
    if !dest.is_file() {
        return Err(CopyFailure {
            relative_path: relative,
            reason: CopyFailureReason::MissingAfterCopy,
        });
    }
    match files_equal(source, dest) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CopyFailure {
            relative_path: relative,
            reason: CopyFailureReason::ChecksumMismatch,
        }),
        Err(err) => Err(CopyFailure::io(relative, err)),
    }
}

fn copy_tree_once(source: &Path, dest: &Path, overwrite: bool) -> Result<(), CopyFailure> {
    if !source.is_dir() {
        return Err(CopyFailure::io(
            "",
            format!("source directory {} does not exist", source.display()),
        ));
    }
    fs::create_dir_all(dest).map_err(|e| CopyFailure::io("", e))?;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CopyFailure::io("", e))?;
        let relative = relative_to(source, entry.path())?;
        let target = dest.join(&relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| CopyFailure::io(relative, e))?;
            continue;
        }
        if !entry.path().is_file() {
            continue;
        }
        if !overwrite && target.exists() {
            continue;
        }
        replace_file(entry.path(), &target).map_err(|e| CopyFailure::io(relative, e))?;
    }
    Ok(())
}

/// Deletes everything under `dest` that has no counterpart of the same kind
/// under `source`, so `dest` holds nothing the source does not ship.
///
/// Returns the removed paths, relative to `dest`.
pub fn prune_extras(source: &Path, dest: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !dest.is_dir() {
        return Ok(removed);
    }

    let mut entries = WalkDir::new(dest).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = match entry.path().strip_prefix(dest) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => continue,
        };
        let counterpart = fs::symlink_metadata(source.join(&relative)).ok();
        let is_dir = entry.file_type().is_dir();
        let keep = counterpart.is_some_and(|meta| meta.is_dir() == is_dir);
        if keep {
            continue;
        }

        if is_dir {
            fs::remove_dir_all(entry.path())?;
            entries.skip_current_dir();
        } else {
            fs::remove_file(entry.path())?;
        }
        debug!("pruned {} from {}", relative.display(), dest.display());
        removed.push(relative);
    }
    Ok(removed)
}

/// Copies through a sibling temp file and renames it into place, so the
/// destination is either the old file or the complete new one.
pub fn replace_file(source: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = dest.with_file_name(format!(".{}.{}", name, PARTIAL_SUFFIX));

    let result = fs::copy(source, &partial).and_then(|_| {
        // Read-only payloads cannot be reopened for writing; skip the flush then.
        if let Ok(file) = OpenOptions::new().write(true).open(&partial) {
            file.sync_all()?;
        }
        fs::rename(&partial, dest)
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn relative_to(root: &Path, path: &Path) -> Result<PathBuf, CopyFailure> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| CopyFailure::io(path, e))
}
