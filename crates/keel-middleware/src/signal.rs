//! Readiness channel: delivers the discrete "start" token.
//!
//! The readiness gate polls a [`StartChannel`] once per tick, so every
//! implementation must return immediately.
//!
//! - [`SocketStartChannel`] listens on a Unix datagram socket.  Any process on
//!   the host may send the token with [`send_start`] (the `keel start`
//!   subcommand does exactly that).
//! - [`BusStartChannel`] listens for [`EventPayload::StartSignal`] on
//!   [`Topic::Control`] of an in-process [`EventBus`].

use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use keel_types::{EventPayload, KeelError};
use tracing::{debug, warn};

use crate::bus::{EventBus, Topic, TopicReceiver};

/// The token that opens the gate.
pub const START_TOKEN: &[u8] = b"start";

/// Source of the discrete "start" token.
pub trait StartChannel: Send {
    /// Non-blocking receive.  Returns `true` if a start token arrived since the
    /// previous call.
    fn try_recv_start(&mut self) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// Unix datagram socket
// ─────────────────────────────────────────────────────────────────────────────

/// Readiness channel bound to a Unix datagram socket.
///
/// The socket file is removed when the channel is dropped.
pub struct SocketStartChannel {
    socket: UnixDatagram,
    path: PathBuf,
}

impl SocketStartChannel {
    /// Bind at `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, KeelError> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale start socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KeelError::Channel(format!(
                    "cannot remove stale socket {}: {e}",
                    path.display()
                )));
            }
        }
        let socket = UnixDatagram::bind(&path).map_err(|e| {
            KeelError::Channel(format!("cannot bind {}: {e}", path.display()))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| KeelError::Channel(format!("cannot set non-blocking: {e}")))?;
        Ok(Self { socket, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StartChannel for SocketStartChannel {
    fn try_recv_start(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) if buf[..n].trim_ascii() == START_TOKEN => return true,
                Ok(n) => {
                    debug!(bytes = n, "ignoring unknown datagram on start socket");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) => {
                    warn!(error = %e, "start socket receive failed");
                    return false;
                }
            }
        }
    }
}

impl Drop for SocketStartChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Send the start token to a supervisor listening at `path`.
pub fn send_start(path: impl AsRef<Path>) -> Result<(), KeelError> {
    let path = path.as_ref();
    let socket = UnixDatagram::unbound()
        .map_err(|e| KeelError::Channel(format!("cannot create socket: {e}")))?;
    socket
        .send_to(START_TOKEN, path)
        .map_err(|e| KeelError::Channel(format!("cannot send to {}: {e}", path.display())))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process bus
// ─────────────────────────────────────────────────────────────────────────────

/// Readiness channel fed by [`Topic::Control`] events on an [`EventBus`].
pub struct BusStartChannel {
    receiver: TopicReceiver,
}

impl BusStartChannel {
    /// Subscribe to `bus`.  Only tokens published after this call are seen.
    pub fn new(bus: &EventBus) -> Self {
        Self {
            receiver: bus.subscribe_to(Topic::Control),
        }
    }
}

impl StartChannel for BusStartChannel {
    fn try_recv_start(&mut self) -> bool {
        while let Some(event) = self.receiver.try_recv() {
            if matches!(event.payload, EventPayload::StartSignal) {
                return true;
            }
        }
        false
    }
}
