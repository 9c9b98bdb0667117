//! Connection lifecycle: open, message, close, error.

use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wsgate_core::{ConnectionId, GatewayError};

use crate::channels::ChannelRegistry;
use crate::connection::{ClientConnection, OutboundFrame};
use crate::dispatcher::{DispatchOutcome, MessageDispatcher};
use crate::metrics::{
    CHANNELS_ACTIVE, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_DISCONNECTIONS_TOTAL, WS_TRANSPORT_ERRORS_TOTAL,
};
use crate::registry::Registry;

/// Default outbound queue depth per connection.
const DEFAULT_SEND_QUEUE: usize = 1024;

/// Owns the live connection set through the shared [`Registry`].
pub struct ConnectionManager {
    registry: Arc<Registry>,
    channels: ChannelRegistry,
    dispatcher: Arc<MessageDispatcher>,
    send_queue_capacity: usize,
}

impl ConnectionManager {
    pub fn new(registry: Arc<Registry>, dispatcher: Arc<MessageDispatcher>) -> Self {
        Self {
            channels: ChannelRegistry::new(registry.clone()),
            registry,
            dispatcher,
            send_queue_capacity: DEFAULT_SEND_QUEUE,
        }
    }

    #[must_use]
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    /// Register a new connection with a fresh ID.
    ///
    /// Returns the connection and the receiving end of its outbound queue,
    /// which the socket writer drains.
    pub fn on_open(&self) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(self.send_queue_capacity);
        let conn = loop {
            let candidate = Arc::new(ClientConnection::new(ConnectionId::new(), tx.clone()));
            if self.registry.insert(candidate.clone()) {
                break candidate;
            }
        };
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.registry.len() as f64);
        info!(conn_id = %conn.id, "client connected");
        (conn, rx)
    }

    /// Handle one inbound text frame.
    ///
    /// Activity is recorded before parsing, so malformed frames still count
    /// as liveness. Frames for unknown connections are dropped.
    pub async fn on_message(&self, conn_id: &ConnectionId, raw: &str) -> Option<DispatchOutcome> {
        let Some(conn) = self.registry.get(conn_id) else {
            debug!(conn_id = %conn_id, "message for unknown connection dropped");
            return None;
        };
        conn.touch();
        Some(self.dispatcher.handle(&conn, raw).await)
    }

    /// Record transport activity that carries no request (ping, pong,
    /// non-UTF-8 binary).
    pub fn on_activity(&self, conn_id: &ConnectionId) {
        if let Some(conn) = self.registry.get(conn_id) {
            conn.touch();
        }
    }

    /// Tear a connection down: drop every subscription and the registry
    /// entry in one step. Returns `false` if it was already gone.
    pub fn on_close(&self, conn_id: &ConnectionId) -> bool {
        let Some((conn, channels)) = self.registry.remove(conn_id) else {
            return false;
        };
        conn.close();

        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.registry.len() as f64);
        gauge!(CHANNELS_ACTIVE).set(self.registry.channel_count() as f64);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
        info!(
            conn_id = %conn_id,
            channels = channels.len(),
            dropped = conn.drop_count(),
            "client disconnected"
        );
        true
    }

    /// Log a transport error. Never fatal to the process.
    pub fn on_error(&self, conn_id: &ConnectionId, err: &GatewayError) {
        let benign = err.is_benign_transport();
        counter!(WS_TRANSPORT_ERRORS_TOTAL, "benign" => if benign { "true" } else { "false" })
            .increment(1);
        if benign {
            warn!(conn_id = %conn_id, error = %err, "connection dropped without close handshake");
        } else {
            error!(conn_id = %conn_id, error = %err, "connection error");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.registry.get(conn_id)
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Ask every connection to close (used on shutdown).
    pub fn close_all(&self) {
        for conn in self.registry.snapshot() {
            conn.close();
        }
    }
}
