use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};

use super::{IpcBackend, IpcListener};

/// Only the updater's own user may talk on its channels.
const SOCKET_MODE: u32 = 0o600;

/// Unix domain sockets; channel names are filesystem paths.
pub struct SocketBackend;

pub struct SocketListener {
    inner: UnixListener,
}

/// Removes a leftover socket at `path`. Anything else living there is an error.
fn clear_stale(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl IpcBackend for SocketBackend {
    type Stream = UnixStream;
    type Listener = SocketListener;

    async fn bind(addr: &str) -> io::Result<Self::Listener> {
        let path = Path::new(addr);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        clear_stale(path)?;

        let inner = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
        Ok(SocketListener { inner })
    }

    async fn connect(addr: &str) -> io::Result<Self::Stream> {
        UnixStream::connect(addr).await
    }

    fn cleanup(addr: &str) {
        let _ = clear_stale(Path::new(addr));
    }
}

#[async_trait]
impl IpcListener for SocketListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        self.inner.accept().await.map(|(stream, _)| stream)
    }
}
