use std::path::Path;

use vigil_common::version::{read_embedded_version, running_version};
use vigil_common::{Version, VigilResult};

/// Where versions come from.
pub trait VersionOracle: Send + Sync {
    /// Version of the running executable.
    fn current(&self) -> Version;

    /// Version embedded in `path`, [`Version::UNKNOWN`] when unreadable.
    fn candidate(&self, path: &Path) -> VigilResult<Version>;
}

/// Reads the build-time version marker out of executables.
#[derive(Debug, Clone)]
pub struct EmbeddedVersionOracle {
    current: Version,
}

impl EmbeddedVersionOracle {
    pub fn new() -> Self {
        Self {
            current: running_version(),
        }
    }

    /// Pins the "running" version, e.g. when the updater is not the binary being updated.
    pub fn with_current(current: Version) -> Self {
        Self { current }
    }
}

impl Default for EmbeddedVersionOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionOracle for EmbeddedVersionOracle {
    fn current(&self) -> Version {
        self.current
    }

    fn candidate(&self, path: &Path) -> VigilResult<Version> {
        read_embedded_version(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vigil_common::VigilError;

    #[test]
    fn candidate_reads_marker_from_disk() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("agent");
        let mut bytes = b"\x7fELF padding ".to_vec();
        bytes.extend_from_slice(vigil_common::version::marker_bytes("2.1.0.0").as_slice());
        bytes.extend_from_slice(b" trailing");
        std::fs::write(&exe, bytes).unwrap();

        let oracle = EmbeddedVersionOracle::with_current(Version::new(2, 0, 5, 0));
        assert_eq!(oracle.candidate(&exe).unwrap(), Version::new(2, 1, 0, 0));
        assert_eq!(oracle.current(), Version::new(2, 0, 5, 0));
    }

    #[test]
    fn unmarked_file_is_unknown_and_missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let exe = temp.path().join("agent");
        std::fs::write(&exe, b"no marker here").unwrap();

        let oracle = EmbeddedVersionOracle::new();
        assert_eq!(oracle.candidate(&exe).unwrap(), Version::UNKNOWN);
        assert!(matches!(
            oracle.candidate(&temp.path().join("missing")),
            Err(VigilError::NotFound { .. })
        ));
    }

    #[test]
    fn running_version_matches_build_info() {
        let oracle = EmbeddedVersionOracle::new();
        assert_eq!(
            oracle.current().to_string(),
            vigil_build_info::file_version()
        );
    }
}
