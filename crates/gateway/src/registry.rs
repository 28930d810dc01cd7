use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    naclgate_auth::Channel,
    serde_json::Value,
    tokio::sync::{RwLock, mpsc},
    tracing::{debug, info, warn},
};

// ── Connection ───────────────────────────────────────────────────────────────

/// Frames queued for a connection's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
struct ConnectionInner {
    id: String,
    channel: Arc<Channel>,
    remote: Option<SocketAddr>,
    connected_at: Instant,
    sender: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

/// A live streaming connection. Cheap to clone; all clones share one write loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its write loop drains.
    pub fn new(
        channel: Arc<Channel>,
        remote: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = ConnectionInner {
            id: uuid::Uuid::new_v4().to_string(),
            channel,
            remote,
            connected_at: Instant::now(),
            sender,
            closed: AtomicBool::new(false),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The channel negotiated during the handshake.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.inner.channel
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn send_text(&self, frame: String) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.inner.id.clone()));
        }
        self.inner
            .sender
            .send(Outbound::Text(frame))
            .map_err(|_| TransportError::Closed(self.inner.id.clone()))
    }

    pub fn send_json(&self, value: &Value) -> Result<(), TransportError> {
        self.send_text(serde_json::to_string(value)?)
    }

    /// Queue a close frame. Only the first call has an effect.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(conn_id = %self.inner.id, code, reason, "closing connection");
        let _ = self.inner.sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.sender.is_closed()
    }
}

/// A decrypted inbound message and the connection it came from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Value,
    pub connection: ConnectionHandle,
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Outcome of one broadcast sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Live streaming connections for one server instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: ConnectionHandle) {
        info!(conn_id = %conn.id(), remote = ?conn.remote(), "connection registered");
        self.connections
            .write()
            .await
            .insert(conn.id().to_string(), conn);
    }

    pub async fn remove(&self, conn_id: &str) -> Option<ConnectionHandle> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send `data` to every connection, then prune the closed ones.
    ///
    /// A failed send is logged and counted; it never stops the sweep.
    pub async fn broadcast(&self, data: &Value) -> BroadcastReport {
        let frame = match serde_json::to_string(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "broadcast payload is not serializable");
                return BroadcastReport::default();
            },
        };

        let targets: Vec<ConnectionHandle> =
            self.connections.read().await.values().cloned().collect();

        let mut report = BroadcastReport::default();
        for conn in &targets {
            match conn.send_text(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(conn_id = %conn.id(), error = %e, "failed to update connection");
                },
            }
        }

        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, conn| !conn.is_closed());
        report.pruned = before - connections.len();

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            pruned = report.pruned,
            "broadcast complete"
        );
        report
    }

    /// Close and forget every connection. Returns how many were closed.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<ConnectionHandle> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close(code, reason);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), code, "closed all connections");
        }
        drained.len()
    }
}
