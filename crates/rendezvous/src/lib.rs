//! Named, process-external channels used by the updater to announce
//! readiness to the process that spawned it and to learn when an
//! observer has attached.

pub mod handshake;
pub mod ipc;

pub use handshake::{
    read_ready, signal_client_connected, ClientHandshake, IpcHandshake, RendezvousMessage,
};
pub use ipc::{DefaultBackend, IpcBackend, IpcListener};
