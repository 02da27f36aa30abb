//! Delivery transport
//!
//! The orchestrator only knows how to address a connected client; how bytes
//! reach it is behind [`Transport`]. [`ConnectionHub`] is the WebSocket
//! implementation: every open socket registers its outbound channel here.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use voicedock_protocol::ServerMessage;

/// Opaque id of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientAddress(pub u64);

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client {0} is not connected")]
    NotConnected(ClientAddress),

    #[error("connection to client {0} is closed")]
    Closed(ClientAddress),
    #[error("outbound queue for client {0} is full")]
    Backpressure(ClientAddress),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, client: ClientAddress, msg: ServerMessage)
        -> Result<(), DeliveryError>;
}

/// Frames queued for a socket's writer task
#[derive(Debug)]
pub enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// Registry of live connections, keyed by [`ClientAddress`]
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<ClientAddress, mpsc::Sender<OutboundMessage>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel and hand out its address
    pub fn connect(&self, tx: mpsc::Sender<OutboundMessage>) -> ClientAddress {
        let addr = ClientAddress(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.insert(addr, tx);
        addr
    }

    pub fn disconnect(&self, addr: ClientAddress) {
        self.connections.remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl Transport for ConnectionHub {
    async fn deliver(
        &self,
        client: ClientAddress,
        msg: ServerMessage,
    ) -> Result<(), DeliveryError> {
        // Clone the sender so the map guard is not held across the await.
        let tx = self
            .connections
            .get(&client)
            .map(|entry| entry.value().clone())
            .ok_or(DeliveryError::NotConnected(client))?;

        // Never wait on a slow reader; a full queue is a failed delivery.
        tx.try_send(OutboundMessage::Json(msg)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure(client),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(client),
        })
    }
}
