use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
};
use tokio::time::sleep;

use super::{IpcBackend, IpcListener};

/// Windows named pipes; channel names are pipe names (`vigil-ready`,
/// `pipe:vigil-ready` or a full `\\.\pipe\...` path).
pub struct PipeBackend;

pub struct PipeListener {
    name: String,
    server: NamedPipeServer,
}

/// Either end of a connected pipe.
pub enum PipeStream {
    Server(NamedPipeServer),
    Client(NamedPipeClient),
}

impl Unpin for PipeStream {}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Server(s) => Pin::new(s).poll_read(cx, buf),
            PipeStream::Client(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PipeStream::Server(s) => Pin::new(s).poll_write(cx, buf),
            PipeStream::Client(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Server(s) => Pin::new(s).poll_flush(cx),
            PipeStream::Client(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PipeStream::Server(s) => Pin::new(s).poll_shutdown(cx),
            PipeStream::Client(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}

/// `ERROR_PIPE_BUSY`: every server instance is serving another client.
const PIPE_BUSY: i32 = 231;
const BUSY_RETRIES: u32 = 20;
const BUSY_BACKOFF: Duration = Duration::from_millis(50);

/// Local callers only. `first` refuses to join a pipe someone else already created.
fn server_instance(name: &str, first: bool) -> io::Result<NamedPipeServer> {
    ServerOptions::new()
        .first_pipe_instance(first)
        .reject_remote_clients(true)
        .create(name)
}

#[async_trait]
impl IpcBackend for PipeBackend {
    type Stream = PipeStream;
    type Listener = PipeListener;

    async fn bind(addr: &str) -> io::Result<Self::Listener> {
        let name = pipe_name(addr);
        let server = server_instance(&name, true).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("pipe {} is already owned by another process", name),
            ),
            _ => e,
        })?;
        Ok(PipeListener { name, server })
    }

    async fn connect(addr: &str) -> io::Result<Self::Stream> {
        let name = pipe_name(addr);
        let mut busy = 0;
        loop {
            match ClientOptions::new().open(&name) {
                Ok(client) => return Ok(PipeStream::Client(client)),
                Err(e) if e.raw_os_error() == Some(PIPE_BUSY) && busy < BUSY_RETRIES => {
                    busy += 1;
                    sleep(BUSY_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl IpcListener for PipeListener {
    type Stream = PipeStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        self.server.connect().await?;
        let next = server_instance(&self.name, false)?;
        Ok(PipeStream::Server(std::mem::replace(&mut self.server, next)))
    }
}

fn pipe_name(addr: &str) -> String {
    let trimmed = addr.trim();
    if trimmed.starts_with(r"\\.\pipe\") {
        trimmed.to_string()
    } else if let Some(name) = trimmed.strip_prefix("pipe:") {
        format!(r"\\.\pipe\{}", name)
    } else {
        format!(r"\\.\pipe\{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_are_normalised() {
        assert_eq!(pipe_name("vigil-ready"), r"\\.\pipe\vigil-ready");
        assert_eq!(pipe_name("pipe:vigil-ready"), r"\\.\pipe\vigil-ready");
        assert_eq!(pipe_name(r"\\.\pipe\custom"), r"\\.\pipe\custom");
    }

    #[tokio::test]
    async fn second_bind_on_a_live_pipe_is_refused() {
        let name = format!("vigil-test-{}", std::process::id());
        let _owner = PipeBackend::bind(&name).await.unwrap();

        let err = PipeBackend::bind(&name).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
