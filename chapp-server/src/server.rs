//! WebSocket fan-out server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► MessageStore ──► KvBackend
//!             ├── Session (task) ── ChatService
//! Client B ──┘        │                └──► Broadcaster
//!                     │                          │
//!                     ▼                          ▼
//!             ConnectionRegistry ◄──── for_each(try_send)
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! Each accepted TCP stream gets its own task running a session:
//! `Connecting → Open → Closed`. While open the task waits on the next
//! inbound frame or the next outbound broadcast frame, whichever comes first,
//! so frames from one client are handled strictly in arrival order.
//!
//! Only `create` is accepted over the socket. `edit` and `delete` are served
//! by [`ChatService`] (the HTTP side) and reach sockets as broadcasts.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broadcast::BroadcastStats;
use crate::protocol::{ClientRequest, ProtocolError};
use crate::registry::{ChannelError, Connection, ConnectionId, ConnectionRegistry};
use crate::service::ChatService;
use crate::storage::{BackendError, KvBackend, MemoryBackend, RocksBackend, RocksConfig};
use crate::store::{MessageStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as too slow
    pub outbound_buffer: usize,
    /// Message store limits
    pub store: StoreConfig,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// How long shutdown waits for sessions before aborting them
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            outbound_buffer: 256,
            store: StoreConfig::default(),
            storage_path: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub messages_created: u64,
    pub broadcast: BroadcastStats,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_rejected: AtomicU64,
    messages_created: AtomicU64,
}

/// Lifecycle of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Per-connection bookkeeping for the session loop.
struct Session {
    addr: SocketAddr,
    id: Option<ConnectionId>,
    state: SessionState,
}

impl Session {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            id: None,
            state: SessionState::Connecting,
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!(
            "Session {} ({:?}): {:?} -> {:?}",
            self.addr,
            self.id,
            self.state,
            next
        );
        self.state = next;
    }
}

/// The chat server.
pub struct ChatServer {
    config: ServerConfig,
    service: Arc<ChatService>,
    stats: Arc<AtomicServerStats>,
}

impl ChatServer {
    /// Create a server over an already opened backend.
    pub fn new(config: ServerConfig, backend: Arc<dyn KvBackend>) -> Self {
        let store = MessageStore::with_config(backend, config.store.clone());
        let service = Arc::new(ChatService::new(store, Arc::new(ConnectionRegistry::new())));
        Self {
            config,
            service,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Open the backend named by the config (RocksDB if `storage_path` is set).
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let backend: Arc<dyn KvBackend> = match &config.storage_path {
            Some(path) => Arc::new(RocksBackend::open(RocksConfig {
                path: path.clone(),
                ..RocksConfig::default()
            })?),
            None => Arc::new(MemoryBackend::new()),
        };
        log::info!("Using {} backend", backend.name());
        Ok(Self::new(config, backend))
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(MemoryBackend::new()))
    }

    /// Request-style entry points sharing this server's store and registry.
    pub fn service(&self) -> &Arc<ChatService> {
        &self.service
    }

    /// Configured listen address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Snapshot of server and broadcast counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.service.registry().len(),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
            messages_created: self.stats.messages_created.load(Ordering::Relaxed),
            broadcast: self.service.broadcast_stats(),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the process ends.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every connection and
    /// flush the backend.
    ///
    /// Sessions still handshaking when `shutdown` fires are abandoned before
    /// they register. The backend is flushed only after every session task
    /// has finished, so no write lands after the flush.
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Chat server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Session task failed: {e}");
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let service = self.service.clone();
                    let stats = self.stats.clone();
                    let buffer = self.config.outbound_buffer;
                    let stop = stop_rx.clone();

                    sessions.spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, service, stats, buffer, stop).await {
                            log::warn!("Connection {addr} ended with error: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
            }
        }

        drop(listener);
        stop_tx.send_replace(true);
        let closed = self.service.registry().clear();
        log::info!("Closed {closed} connections, waiting for {} sessions", sessions.len());

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(finished) = sessions.join_next().await {
                if let Err(e) = finished {
                    log::error!("Session task failed: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Aborting {} sessions still running after shutdown timeout", sessions.len());
            sessions.shutdown().await;
        }

        self.service.shutdown()?;
        Ok(())
    }

    /// Run one session to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<ChatService>,
        stats: Arc<AtomicServerStats>,
        outbound_buffer: usize,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let mut session = Session::new(addr);

        let ws_stream = tokio::select! {
            biased;
            _ = stop.wait_for(|stopping| *stopping) => {
                log::debug!("Dropping {addr} mid-handshake: server shutting down");
                session.transition(SessionState::Closed);
                return Ok(());
            }
            handshake = tokio_tungstenite::accept_async(stream) => {
                handshake.map_err(|e| ChannelError::Transport(e.to_string()))?
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (conn, mut outbound_rx) = Connection::new(Some(addr), outbound_buffer);
        let registration = service.registry().register(conn);
        session.id = Some(registration.id());
        session.transition(SessionState::Open);
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        log::info!("WebSocket connection {} established from {addr}", registration.id());

        let result = loop {
            tokio::select! {
                biased;

                _ = async { let _ = stop.wait_for(|stopping| *stopping).await; } => {
                    log::info!("Closing connection {addr}: server shutting down");
                    break Ok(());
                }

                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            Self::handle_frame(&service, &stats, &session, text.as_str());
                        }

                        Some(Ok(WsMessage::Binary(data))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                            log::debug!("Ignoring {}-byte binary frame from {addr}", data.len());
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = ws_sender.send(WsMessage::Pong(data)).await {
                                break Err(ChannelError::Transport(e.to_string()));
                            }
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(_)) => {}

                        Some(Err(e)) => {
                            log::warn!("WebSocket read error from {addr}: {e}");
                            break Err(ChannelError::Transport(e.to_string()));
                        }
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(WsMessage::Text(frame.to_string().into())).await {
                                log::warn!("WebSocket write error to {addr}: {e}");
                                break Err(ChannelError::Transport(e.to_string()));
                            }
                        }
                        None => {
                            // Registry dropped us: pruned by a broadcast or server shutdown.
                            log::info!("Connection {addr} removed from registry");
                            break Ok(());
                        }
                    }
                }
            }
        };

        session.transition(SessionState::Closed);
        drop(registration);
        if let Err(e) = ws_sender.close().await {
            log::debug!("Close handshake with {addr} failed: {e}");
        }

        result
    }

    /// Decode and dispatch one text frame. Never fatal to the connection.
    fn handle_frame(
        service: &ChatService,
        stats: &AtomicServerStats,
        session: &Session,
        text: &str,
    ) {
        match ClientRequest::decode(text) {
            Ok(ClientRequest::Create(msg)) => match service.create(msg) {
                Ok(stored) => {
                    stats.messages_created.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Created message {} from {}", stored.id, session.addr);
                }
                Err(e) => {
                    log::warn!("Create from {} failed: {e}", session.addr);
                }
            },
            Ok(other) => {
                stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Ignoring {} request from {}: not accepted over WebSocket",
                    other.kind().as_str(),
                    session.addr
                );
            }
            Err(ProtocolError::UnknownType(tag)) => {
                stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("No handler for message type '{tag}' from {}", session.addr);
            }
            Err(e) => {
                stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed frame from {}: {e}", session.addr);
            }
        }
    }
}
