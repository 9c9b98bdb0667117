//! WebSocket client connection state.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wsgate_core::{ConnectionId, ResponseEnvelope};

/// A frame queued for the connection's socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized JSON text.
    Text(Arc<String>),
    /// Keep-alive probe.
    Ping,
    /// Close the socket.
    Close,
}

/// A connected WebSocket client.
///
/// Owned by the [`Registry`](crate::registry::Registry); everything else
/// holds short-lived `Arc` clones.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the socket writer task.
    tx: mpsc::Sender<OutboundFrame>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Last inbound transport activity (or keep-alive compensation stamp).
    last_activity: Mutex<Instant>,
    /// Probes sent since the last inbound activity.
    missed_probes: AtomicU32,
    /// Cancelled once the connection is closing.
    closed: CancellationToken,
    /// Count of frames dropped due to a full or closed queue.
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            missed_probes: AtomicU32::new(0),
            closed: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a pre-serialized text frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        self.enqueue(OutboundFrame::Text(message))
    }

    /// Queue a response envelope.
    pub fn send_envelope(&self, envelope: &ResponseEnvelope) -> bool {
        self.send(Arc::new(envelope.to_text()))
    }

    /// Queue a keep-alive probe.
    pub fn probe(&self) -> bool {
        self.enqueue(OutboundFrame::Ping)
    }

    fn enqueue(&self, frame: OutboundFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Begin closing: wake the session loop and ask the writer to send a
    /// close frame. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        // Best effort: a full queue still gets torn down via the token.
        let _ = self.tx.try_send(OutboundFrame::Close);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when [`close`](Self::close) is called.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Record inbound transport activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.missed_probes.store(0, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Overwrite the activity stamp (keep-alive compensation).
    pub fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }

    /// Time since the last activity stamp, measured from `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Count a sent probe; returns the new unanswered total.
    pub fn record_probe(&self) -> u32 {
        self.missed_probes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_probes(&self) -> u32 {
        self.missed_probes.load(Ordering::Relaxed)
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("missed_probes", &self.missed_probes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use wsgate_core::Correlation;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(ConnectionId::from_raw("ws_1"), tx);
        (conn, rx)
    }

    fn text(frame: OutboundFrame) -> String {
        match frame {
            OutboundFrame::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send(Arc::new("hello".into())));
        assert_eq!(text(rx.recv().await.unwrap()), "hello");
    }

    #[tokio::test]
    async fn send_to_closed_channel_counts_drop() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_full_channel_returns_false() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(ConnectionId::new(), tx);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_envelope_serializes() {
        let (conn, mut rx) = make_connection();
        let env = ResponseEnvelope::success(Correlation::id(json!(3)), json!("ok"));
        assert!(conn.send_envelope(&env));
        let parsed: Value = serde_json::from_str(&text(rx.recv().await.unwrap())).unwrap();
        assert_eq!(parsed, json!({"id": 3, "result": "ok"}));
    }

    #[tokio::test]
    async fn close_queues_close_frame_and_blocks_sends() {
        let (conn, mut rx) = make_connection();
        let token = conn.closed_token();
        conn.close();
        conn.close();
        assert!(token.is_cancelled());
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Close);
        assert!(!conn.send(Arc::new("late".into())));
        assert!(!conn.probe());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn probe_queues_ping() {
        let (conn, mut rx) = make_connection();
        assert!(conn.probe());
        assert_eq!(rx.recv().await.unwrap(), OutboundFrame::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time_and_missed_probes() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_secs(10));

        assert_eq!(conn.record_probe(), 1);
        assert_eq!(conn.record_probe(), 2);
        conn.touch();
        assert_eq!(conn.missed_probes(), 0);
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_stamp_in_future_is_not_idle() {
        let (conn, _rx) = make_connection();
        conn.set_last_activity(Instant::now() + Duration::from_secs(5));
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }
}
