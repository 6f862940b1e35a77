//! Deciding whether a staged bundle should replace production.
//!
//! Two checks run in order: the version gate compares the staged
//! executable's version with the running one, then the necessity check
//! (skipped when forced) looks for any staged file that differs from
//! production.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use vigil_common::fs::files_equal;
use vigil_common::{VersionPair, VigilError, VigilResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceedReason {
    Newer,
    /// Same version, different executable content
    ContentDrift,
    Forced,
    Downgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoUpdateRequired,
    FilesIdentical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    VersionTooOld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed(ProceedReason),
    Skip(SkipReason),
    Reject(RejectReason),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NoUpdateRequired => "no update required",
            SkipReason::FilesIdentical => "files are identical",
        })
    }
}

impl fmt::Display for ProceedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProceedReason::Newer => "newer version",
            ProceedReason::ContentDrift => "same version, different content",
            ProceedReason::Forced => "forced",
            ProceedReason::Downgrade => "downgrade allowed",
        })
    }
}

/// Version gate.
///
/// `executables_identical` is only consulted when the versions are equal.
pub fn decide_version(
    pair: VersionPair,
    force: bool,
    allow_downgrade: bool,
    executables_identical: impl FnOnce() -> VigilResult<bool>,
) -> VigilResult<GateDecision> {
    Ok(match pair.candidate_ordering() {
        Ordering::Greater => GateDecision::Proceed(ProceedReason::Newer),
        Ordering::Equal => {
            if !executables_identical()? {
                GateDecision::Proceed(ProceedReason::ContentDrift)
            } else if force {
                GateDecision::Proceed(ProceedReason::Forced)
            } else {
                GateDecision::Skip(SkipReason::NoUpdateRequired)
            }
        }
        Ordering::Less if allow_downgrade => GateDecision::Proceed(ProceedReason::Downgrade),
        Ordering::Less => GateDecision::Reject(RejectReason::VersionTooOld),
    })
}

/// First staged file that is missing from production or differs from it.
pub fn first_difference(staging: &Path, production: &Path) -> VigilResult<Option<PathBuf>> {
    for entry in WalkDir::new(staging).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf);
            VigilError::io(path, "scan staging", std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(staging)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| entry.path().to_path_buf());
        let installed = production.join(&relative);
        if !installed.is_file() || !files_equal(entry.path(), &installed)? {
            return Ok(Some(relative));
        }
    }
    Ok(None)
}

/// Runs both checks. The necessity check only runs when the version gate proceeds unforced.
pub fn evaluate(
    pair: VersionPair,
    force: bool,
    allow_downgrade: bool,
    staged_executable: &Path,
    production_executable: &Path,
    staging: &Path,
    production: &Path,
) -> VigilResult<GateDecision> {
    let decision = decide_version(pair, force, allow_downgrade, || {
        if !production_executable.is_file() {
            return Ok(false);
        }
        files_equal(staged_executable, production_executable)
    })?;

    match decision {
        GateDecision::Proceed(_) if !force => match first_difference(staging, production)? {
            Some(_) => Ok(decision),
            None => Ok(GateDecision::Skip(SkipReason::FilesIdentical)),
        },
        other => Ok(other),
    }
}
