//! Local, same-machine channels. A channel name is a socket path on Unix
//! and a pipe name on Windows; either way only the local machine and,
//! where the platform allows it, only the owning user can connect.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

#[async_trait]
pub trait IpcBackend: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: IpcListener<Stream = Self::Stream> + Send + 'static;

    /// Creates the channel. A leftover Unix socket is replaced; a live pipe
    /// or a non-socket file holding the name is an `AlreadyExists` error.
    async fn bind(addr: &str) -> io::Result<Self::Listener>;
    async fn connect(addr: &str) -> io::Result<Self::Stream>;

    /// Removes whatever `bind` left behind once the channel is done.
    fn cleanup(_addr: &str) {}
}

#[async_trait]
pub trait IpcListener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub type DefaultBackend = unix::SocketBackend;

#[cfg(windows)]
pub type DefaultBackend = windows::PipeBackend;
