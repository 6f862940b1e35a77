//! Shared building blocks for the vigil update engine: errors, versions,
//! notifications, retry policy and the verified file operations.

pub mod errors;
pub mod fs;
pub mod notify;
pub mod retry;
pub mod version;

pub use errors::{ErrorCategory, VigilError, VigilResult};
pub use notify::{NotificationEvent, NotificationSink, Notifier, Severity};
pub use retry::RetryPolicy;
pub use version::{Version, VersionPair};
