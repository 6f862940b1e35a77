use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::errors::{VigilError, VigilResult};

/// SHA-256 of a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Hashes the full content of `path`. Always reads from disk.
pub fn digest(path: &Path) -> VigilResult<Digest> {
    let mut file =
        File::open(path).map_err(|e| VigilError::io(Some(path.to_path_buf()), "open for digest", e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| VigilError::io(Some(path.to_path_buf()), "read for digest", e))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Ok(Digest(out))
}

/// True when both files hash to the same digest.
pub fn files_equal(a: &Path, b: &Path) -> VigilResult<bool> {
    Ok(digest(a)? == digest(b)?)
}
