//! Parameters of a single update invocation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where the update bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    /// A directory readable as-is
    Local(PathBuf),
    /// A share that has to be mounted first (`//host/share`, `\\host\share`, `smb://...`)
    Network(String),
}

impl UpdateSource {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with(r"\\") || trimmed.starts_with("//") || trimmed.contains("://") {
            UpdateSource::Network(trimmed.to_string())
        } else {
            UpdateSource::Local(PathBuf::from(trimmed))
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, UpdateSource::Network(_))
    }
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Local(path) => write!(f, "{}", path.display()),
            UpdateSource::Network(remote) => f.write_str(remote),
        }
    }
}

/// Share credentials. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub source: UpdateSource,
    pub credentials: Option<Credentials>,
    /// Proceed even when versions and content match
    pub force: bool,
    pub allow_downgrade: bool,
    /// How long to wait for an observer; zero waits forever
    pub client_timeout: Duration,
}

impl UpdateRequest {
    pub fn new(source: UpdateSource) -> Self {
        Self {
            source,
            credentials: None,
            force: false,
            allow_downgrade: false,
            client_timeout: Duration::ZERO,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// `None` when the client wait is unbounded.
    pub fn client_deadline(&self) -> Option<Duration> {
        (!self.client_timeout.is_zero()).then_some(self.client_timeout)
    }
}
