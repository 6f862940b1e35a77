//! Four-part file versions and the embedded version marker.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::errors::{VigilError, VigilResult};

/// `major.minor.build.revision`, ordered component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version '{input}'")]
pub struct ParseVersionError {
    input: String,
}

impl Version {
    /// Placeholder for unreadable metadata; compares lower than any real version.
    pub const UNKNOWN: Version = Version::new(0, 0, 0, 0);

    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }

    /// Parses `input`, falling back to [`Version::UNKNOWN`].
    pub fn parse_lenient(input: &str) -> Self {
        input.parse().unwrap_or(Self::UNKNOWN)
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError {
            input: s.to_string(),
        };
        let trimmed = s.trim().trim_start_matches('v');
        if trimmed.is_empty() {
            return Err(err());
        }

        let mut parts = [0u32; 4];
        let mut count = 0;
        for piece in trimmed.split('.') {
            if count == 4 {
                return Err(err());
            }
            parts[count] = piece.parse().map_err(|_| err())?;
            count += 1;
        }

        Ok(Version::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// `(current, candidate)` as compared by the version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPair {
    pub current: Version,
    pub candidate: Version,
}

impl VersionPair {
    pub fn new(current: Version, candidate: Version) -> Self {
        Self { current, candidate }
    }

    /// Ordering of the candidate relative to the running version.
    pub fn candidate_ordering(&self) -> Ordering {
        self.candidate.cmp(&self.current)
    }
}

/// Version of the running executable, taken from its own build metadata.
pub fn running_version() -> Version {
    Version::parse_lenient(vigil_build_info::file_version())
}

/// Reads the embedded version marker from an executable on disk.
///
/// Fails with [`VigilError::NotFound`] when the file is absent. A file
/// without a readable marker yields [`Version::UNKNOWN`].
pub fn read_embedded_version(path: &Path) -> VigilResult<Version> {
    let bytes = std::fs::read(path)
        .map_err(|e| VigilError::io(Some(path.to_path_buf()), "read version metadata", e))?;
    Ok(scan_marker(&bytes, vigil_build_info::MARKER_PREFIX.as_bytes()).unwrap_or(Version::UNKNOWN))
}

/// The marker bytes a binary built at `version` carries.
pub fn marker_bytes(version: &str) -> Vec<u8> {
    let mut bytes = vigil_build_info::MARKER_PREFIX.as_bytes().to_vec();
    bytes.extend_from_slice(version.as_bytes());
    bytes.push(0);
    bytes
}

const MAX_MARKER_VALUE: usize = 48;

fn scan_marker(haystack: &[u8], prefix: &[u8]) -> Option<Version> {
    if prefix.is_empty() || haystack.len() < prefix.len() {
        return None;
    }

    let mut offset = 0;
    while offset + prefix.len() <= haystack.len() {
        let window = &haystack[offset..];
        let Some(hit) = window.iter().position(|b| *b == prefix[0]) else {
            return None;
        };
        let start = offset + hit;
        if haystack[start..].starts_with(prefix) {
            let value_start = start + prefix.len();
            let value_end = (value_start + MAX_MARKER_VALUE).min(haystack.len());
            let value = &haystack[value_start..value_end];
            if let Some(nul) = value.iter().position(|b| *b == 0) {
                let candidate = std::str::from_utf8(&value[..nul]).ok();
                // Only fully-specified markers count; the bare prefix also appears in rodata.
                if let Some(version) = candidate
                    .filter(|text| text.split('.').count() == 4)
                    .and_then(|text| text.parse().ok())
                {
                    return Some(version);
                }
            }
        }
        offset = start + 1;
    }
    None
}
