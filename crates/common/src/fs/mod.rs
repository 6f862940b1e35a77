pub mod checksum;
pub mod copy;
pub mod release;

pub use checksum::{digest, files_equal, Digest};
pub use copy::{prune_extras, replace_file, verify_tree, CopyFailure, CopyFailureReason, CopyOutcome, VerifiedCopier};
pub use release::{first_locked_file, wait_for_release, ReleaseSweep};
