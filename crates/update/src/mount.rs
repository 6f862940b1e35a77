//! Making a network update source readable as a local directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use vigil_common::{VigilError, VigilResult};

use crate::command;
use crate::config::MountConfig;
use crate::request::Credentials;

#[async_trait]
pub trait MountProvider: Send + Sync {
    async fn mount(&self, remote: &str, credentials: Option<&Credentials>) -> VigilResult<()>;

    async fn unmount(&self, remote: &str) -> VigilResult<()>;

    /// Local directory the share's content is read from once mounted.
    fn effective_local_path(&self, remote: &str) -> PathBuf;
}

/// Shares that are already reachable as paths (pre-mounted, or UNC paths on Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMount;

#[async_trait]
impl MountProvider for NoMount {
    async fn mount(&self, remote: &str, _credentials: Option<&Credentials>) -> VigilResult<()> {
        if Path::new(remote).is_dir() {
            Ok(())
        } else {
            Err(VigilError::Mount {
                remote: remote.to_string(),
                reason: "not reachable and no mount command is configured".to_string(),
            })
        }
    }

    async fn unmount(&self, _remote: &str) -> VigilResult<()> {
        Ok(())
    }

    fn effective_local_path(&self, remote: &str) -> PathBuf {
        PathBuf::from(remote)
    }
}

/// Runs configured mount and unmount command lines.
///
/// The password never appears on a command line; it is handed to the
/// mount command through the configured environment variable.
#[derive(Debug, Clone)]
pub struct CommandMount {
    mount: Vec<String>,
    unmount: Vec<String>,
    mount_root: PathBuf,
    password_env: String,
}

impl CommandMount {
    pub fn new(config: &MountConfig) -> Self {
        Self {
            mount: config.mount.clone(),
            unmount: config.unmount.clone(),
            mount_root: config.mount_root.clone(),
            password_env: config.password_env.clone(),
        }
    }

    fn failure(remote: &str, reason: impl Into<String>) -> VigilError {
        VigilError::Mount {
            remote: remote.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MountProvider for CommandMount {
    async fn mount(&self, remote: &str, credentials: Option<&Credentials>) -> VigilResult<()> {
        let local = self.effective_local_path(remote);
        std::fs::create_dir_all(&local)
            .map_err(|e| VigilError::io(Some(local.clone()), "create mount point", e))?;

        let local_str = local.to_string_lossy();
        let user = credentials.map(|c| c.user.as_str()).unwrap_or("");
        let argv = command::expand(
            &self.mount,
            &[("remote", remote), ("local", &local_str), ("user", user)],
        );
        let env: Vec<(&str, &str)> = credentials
            .map(|c| vec![(self.password_env.as_str(), c.password())])
            .unwrap_or_default();

        let output = command::run(&argv, &env)
            .await
            .map_err(|e| Self::failure(remote, e.to_string()))?;
        if !output.status.success() {
            return Err(Self::failure(remote, command::describe_failure(&output)));
        }
        debug!("mounted {} at {}", remote, local.display());
        Ok(())
    }

    async fn unmount(&self, remote: &str) -> VigilResult<()> {
        let local = self.effective_local_path(remote);
        let local_str = local.to_string_lossy();
        let argv = command::expand(&self.unmount, &[("remote", remote), ("local", &local_str)]);

        let output = command::run(&argv, &[])
            .await
            .map_err(|e| Self::failure(remote, e.to_string()))?;
        if !output.status.success() {
            return Err(Self::failure(
                remote,
                format!("unmount {}", command::describe_failure(&output)),
            ));
        }
        let _ = std::fs::remove_dir(&local);
        Ok(())
    }

    fn effective_local_path(&self, remote: &str) -> PathBuf {
        self.mount_root.join(mount_point_name(remote))
    }
}

/// Flattens a share name into a single directory name.
fn mount_point_name(remote: &str) -> String {
    let name: String = remote
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    let name = name.trim_matches('_');
    if name.is_empty() {
        "share".to_string()
    } else {
        name.to_string()
    }
}

/// Picks the provider matching the mount configuration.
pub fn provider_for(config: &MountConfig) -> Arc<dyn MountProvider> {
    if config.mount.is_empty() {
        Arc::new(NoMount)
    } else {
        Arc::new(CommandMount::new(config))
    }
}
