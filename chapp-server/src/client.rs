//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Sending new messages, with an outbox for messages written while offline
//! - Decoded broadcast events delivered on a channel
//!
//! Used by the integration tests and by anything that wants to drive the
//! server without a browser.

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{ClientRequest, Message, ProtocolError, ServerEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed by the server
    Disconnected,
    /// A message was created (ours included)
    Created(Message),
    /// A message's content changed
    Edited { msg_id: String, content: String },
    /// A message was removed
    Deleted(String),
}

impl From<ServerEvent> for ChatEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::Create(msg) => Self::Created(msg),
            ServerEvent::Edit(notice) => Self::Edited {
                msg_id: notice.msg_id,
                content: notice.content,
            },
            ServerEvent::Delete(notice) => Self::Deleted(notice.msg_id),
        }
    }
}

/// Messages written while disconnected, sent in order on the next connect.
pub struct Outbox {
    queue: VecDeque<Message>,
    max_size: usize,
}

impl Outbox {
    /// Outbox holding at most `max_size` messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    /// Returns false if the outbox is full.
    pub fn enqueue(&mut self, msg: Message) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    /// Take every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The chat client.
pub struct ChatClient {
    state: Arc<RwLock<ConnectionState>>,
    outbox: Arc<Mutex<Outbox>>,

    /// Channel to the WebSocket writer task; cleared when the socket goes away
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<WsMessage>>>>,

    event_rx: Option<mpsc::Receiver<ChatEvent>>,
    event_tx: mpsc::Sender<ChatEvent>,

    server_url: String,
}

impl ChatClient {
    /// Create a disconnected client for `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbox: Arc::new(Mutex::new(Outbox::new(1_000))),
            outgoing_tx: Arc::new(RwLock::new(None)),
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        *self.outgoing_tx.write().await = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ChatEvent::Connected).await;

        let queued = self.outbox.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Sending {} queued messages", queued.len());
            for msg in queued {
                let encoded = ClientRequest::Create(msg).encode()?;
                out_tx
                    .send(WsMessage::Text(encoded.into()))
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let outgoing = self.outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            let _ = event_tx.send(event.into()).await;
                        }
                        Err(e) => log::warn!("Ignoring undecodable broadcast: {e}"),
                    },
                    Ok(WsMessage::Ping(data)) => {
                        let _ = out_tx.send(WsMessage::Pong(data)).await;
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Only tear down if no newer connection replaced this one.
            {
                let mut slot = outgoing.write().await;
                if slot.as_ref().is_some_and(|tx| tx.same_channel(&out_tx)) {
                    *slot = None;
                    *state.write().await = ConnectionState::Disconnected;
                }
            }
            // Last sender gone: the writer task sees end-of-channel and drops its half.
            drop(out_tx);
            let _ = event_tx.send(ChatEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a new message. The server assigns its id and broadcasts it back.
    ///
    /// While disconnected the message is queued in the outbox instead.
    pub async fn send_message(&self, msg: Message) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            if !self.outbox.lock().await.enqueue(msg) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let encoded = ClientRequest::Create(msg).encode()?;
        self.send_text(encoded).await
    }

    /// Send an already encoded text frame as is.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send_text(text.into()).await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let taken = self.outgoing_tx.write().await.take();
        if let Some(tx) = taken {
            tx.send(WsMessage::Close(None))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server URL this client connects to.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Messages waiting for the next connect.
    pub async fn outbox_len(&self) -> usize {
        self.outbox.lock().await.len()
    }

    async fn send_text(&self, text: String) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
