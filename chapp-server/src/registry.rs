//! Registry of live duplex connections.
//!
//! Every operation takes the same exclusive lock. [`ConnectionRegistry::for_each`]
//! keeps it for the whole walk, so a broadcast sees one fixed set of
//! recipients, and it removes in place every connection the callback reports
//! as broken. Removing a [`Connection`] drops its outbound sender, which the
//! owning session observes as end-of-stream and answers by closing the socket.
//!
//! Writes never block: each connection owns a bounded outbound buffer and a
//! broadcast only `try_send`s into it. A full buffer means the peer is not
//! keeping up and is treated like a failed write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Registry key.
pub type ConnectionId = Uuid;

/// Encoded envelope shared by all recipients of one broadcast.
pub type Frame = Arc<str>;

/// Write failure on one connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Outbound buffer full")]
    Full,
    #[error("Connection closed")]
    Closed,
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A connection removed by [`ConnectionRegistry::for_each`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedConnection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub error: ChannelError,
}

/// Server-side handle of one duplex connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Frame>,
}

impl Connection {
    /// New handle plus the receiving end of its outbound buffer.
    pub fn new(peer: Option<SocketAddr>, buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            peer,
            outbound,
        };
        (conn, rx)
    }

    /// Registry key of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if the connection came from a socket.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: &Frame) -> Result<(), ChannelError> {
        self.outbound.try_send(frame.clone()).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

/// Thread-safe set of active connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection and return its id.
    pub fn add(&self, conn: Connection) -> ConnectionId {
        let id = conn.id;
        self.lock().insert(id, conn);
        id
    }

    /// Returns the handle if it was still registered. Dropping it closes the
    /// outbound buffer.
    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.lock().remove(id)
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every connection, closing all outbound buffers.
    pub fn clear(&self) -> usize {
        let drained: Vec<Connection> = self.lock().drain().map(|(_, conn)| conn).collect();
        drained.len()
    }

    /// Call `f` on every connection while holding the lock.
    ///
    /// Connections for which `f` fails are removed before the lock is
    /// released and returned with their error. A failure never stops the
    /// walk. Visit order is unspecified.
    pub fn for_each<F>(&self, mut f: F) -> Vec<PrunedConnection>
    where
        F: FnMut(&Connection) -> Result<(), ChannelError>,
    {
        let mut connections = self.lock();
        let mut pruned = Vec::new();

        connections.retain(|id, conn| match f(conn) {
            Ok(()) => true,
            Err(e) => {
                pruned.push(PrunedConnection {
                    id: *id,
                    peer: conn.peer,
                    error: e,
                });
                false
            }
        });

        pruned
    }

    /// Register `conn` for the lifetime of the returned guard.
    pub fn register(self: &Arc<Self>, conn: Connection) -> Registration {
        let id = self.add(conn);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deregisters its connection when dropped, on every exit path.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Registration {
    /// Id of the guarded connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the registry still holds this connection.
    pub fn is_registered(&self) -> bool {
        self.registry.contains(&self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove(&self.id).is_some() {
            log::debug!("Deregistered connection {}", self.id);
        }
    }
}
