//! Readiness announcement and the one-shot "client connected" signal.
//!
//! The updater connects to the *ready* channel its parent listens on and
//! writes a single JSON line naming the *connected* channel. An observer
//! then connects to that channel and writes `{"event":"client_connected"}`,
//! which resolves the one-shot returned by [`ClientHandshake::announce`].

use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use vigil_common::{VigilError, VigilResult};

use crate::ipc::{IpcBackend, IpcListener};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RendezvousMessage {
    Ready {
        pid: u32,
        channel: String,
        version: String,
    },
    ClientConnected,
}

#[async_trait]
pub trait ClientHandshake: Send + Sync {
    /// Announces readiness and returns a receiver that resolves once an
    /// observer is attached. A dropped sender means no observer will come.
    async fn announce(&self) -> VigilResult<oneshot::Receiver<()>>;
}

pub struct IpcHandshake<B: IpcBackend> {
    ready_channel: String,
    connected_channel: String,
    _backend: PhantomData<B>,
}

impl<B: IpcBackend> IpcHandshake<B> {
    pub fn new(ready_channel: impl Into<String>, connected_channel: impl Into<String>) -> Self {
        Self {
            ready_channel: ready_channel.into(),
            connected_channel: connected_channel.into(),
            _backend: PhantomData,
        }
    }

    fn failure(channel: &str, err: impl std::fmt::Display) -> VigilError {
        VigilError::Handshake {
            channel: channel.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl<B: IpcBackend> ClientHandshake for IpcHandshake<B> {
    async fn announce(&self) -> VigilResult<oneshot::Receiver<()>> {
        // Listen first so the observer cannot race the announcement.
        let mut listener = B::bind(&self.connected_channel)
            .await
            .map_err(|e| Self::failure(&self.connected_channel, e))?;

        let ready = RendezvousMessage::Ready {
            pid: std::process::id(),
            channel: self.connected_channel.clone(),
            version: vigil_build_info::file_version().to_string(),
        };
        let line = serde_json::to_string(&ready)
            .map_err(|e| Self::failure(&self.ready_channel, e))?
            + "\n";

        let mut stream = B::connect(&self.ready_channel)
            .await
            .map_err(|e| Self::failure(&self.ready_channel, e))?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Self::failure(&self.ready_channel, e))?;
        stream
            .flush()
            .await
            .map_err(|e| Self::failure(&self.ready_channel, e))?;
        drop(stream);
        debug!("readiness announced on {}", self.ready_channel);

        let (tx, rx) = oneshot::channel();
        let channel = self.connected_channel.clone();
        tokio::spawn(async move {
            match wait_for_client(&mut listener).await {
                Ok(()) => {
                    debug!("observer attached on {}", channel);
                    let _ = tx.send(());
                }
                Err(e) => warn!("connected channel {} closed: {}", channel, e),
            }
            B::cleanup(&channel);
        });

        Ok(rx)
    }
}

async fn wait_for_client<L: IpcListener>(listener: &mut L) -> io::Result<()> {
    loop {
        let stream = listener.accept().await?;
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<RendezvousMessage>(&line) {
                Ok(RendezvousMessage::ClientConnected) => return Ok(()),
                _ => debug!("ignoring rendezvous line: {}", line.trim()),
            }
        }
    }
}

/// Parent side: accepts the updater's connection and returns its announcement.
pub async fn read_ready<L: IpcListener>(listener: &mut L) -> io::Result<RendezvousMessage> {
    let stream = listener.accept().await?;
    let mut lines = BufReader::new(stream).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no readiness line"))?;
    serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Observer side: tells the updater a client is attached.
pub async fn signal_client_connected<B: IpcBackend>(channel: &str) -> io::Result<()> {
    let mut stream = B::connect(channel).await?;
    let line = serde_json::to_string(&RendezvousMessage::ClientConnected)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        + "\n";
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
