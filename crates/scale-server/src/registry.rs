use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use bytes::Bytes;
use scale_core::ClientId;
use tokio::sync::mpsc;

/// A payload queued for one client's socket. Cheap to clone for fan-out.
#[derive(Clone, Debug)]
pub enum Frame {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_str().as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text.into())
    }
}

/// Liveness of a registered connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, history replay not yet sent.
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("client {0} is not registered")]
    NotFound(ClientId),

    #[error("send queue full for client {0}")]
    QueueFull(ClientId),

    #[error("client {0} is closed")]
    Closed(ClientId),
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Not open, or excluded.
    pub skipped: usize,
    pub failed: usize,
}

struct Connection {
    sender: mpsc::Sender<Frame>,
    state: ConnectionState,
}

/// The set of reachable clients.
///
/// Owned by the relay task, so it needs no locking.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ClientId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted client in the `Connecting` state.
    pub fn register(&mut self, id: ClientId, sender: mpsc::Sender<Frame>) {
        let connection = Connection {
            sender,
            state: ConnectionState::Connecting,
        };
        if self.connections.insert(id.clone(), connection).is_some() {
            tracing::warn!(client_id = %id, "client registered twice, replacing");
        }
    }

    /// `Connecting -> Open`. Closed connections stay closed.
    pub fn mark_open(&mut self, id: &ClientId) -> bool {
        match self.connections.get_mut(id) {
            Some(conn) if conn.state == ConnectionState::Connecting => {
                conn.state = ConnectionState::Open;
                true
            }
            _ => false,
        }
    }

    /// Remove a client. Dropping its sender ends the client's writer task.
    pub fn unregister(&mut self, id: &ClientId) -> bool {
        self.connections.remove(id).is_some()
    }

    /// Queue a frame for one client, whatever its open/connecting state.
    pub fn send_to(&mut self, id: &ClientId, frame: Frame) -> Result<(), SendError> {
        let conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| SendError::NotFound(id.clone()))?;
        deliver(id, conn, frame)
    }

    /// Queue a frame for every open client except `exclude`.
    ///
    /// Each client is tried independently; one failure never stops the rest.
    pub fn broadcast(&mut self, frame: &Frame, exclude: Option<&ClientId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, conn) in self.connections.iter_mut() {
            if conn.state != ConnectionState::Open || exclude == Some(id) {
                report.skipped += 1;
                continue;
            }
            match deliver(id, conn, frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "broadcast send failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn state(&self, id: &ClientId) -> Option<ConnectionState> {
        self.connections.get(id).map(|c| c.state)
    }

    /// Number of registered connections, in any state.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn open_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.state == ConnectionState::Open)
            .count()
    }
}

fn deliver(id: &ClientId, conn: &mut Connection, frame: Frame) -> Result<(), SendError> {
    if conn.state == ConnectionState::Closed {
        return Err(SendError::Closed(id.clone()));
    }
    match conn.sender.try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::QueueFull(id.clone())),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            conn.state = ConnectionState::Closed;
            Err(SendError::Closed(id.clone()))
        }
    }
}
