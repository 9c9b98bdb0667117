//! One WebSocket connection from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument, Span};
use wsgate_core::{ConnectionId, GatewayError};

use crate::connection::OutboundFrame;
use crate::manager::ConnectionManager;

/// How long the writer gets to flush a close frame after the reader exits.
const WRITER_DRAIN: Duration = Duration::from_secs(1);
/// Inbound requests buffered ahead of the dispatch worker.
const INBOUND_QUEUE: usize = 256;

/// Drive a connected socket.
///
/// Three halves run per connection. The reader owns the socket stream and
/// keeps consuming frames (so pongs and close frames are seen while a
/// backend call is pending). Requests go through a bounded queue to a
/// dispatch worker that handles them one at a time in arrival order, so a
/// synchronous route's response always precedes the next request's. The
/// writer drains the connection's outbound queue.
///
/// When the reader stops, the connection is torn down and any pending
/// dispatch is cancelled.
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (conn, outbound_rx) = manager.on_open();
    let conn_id = conn.id.clone();
    let _ = Span::current().record("conn_id", tracing::field::display(&conn_id));

    let mut writer = tokio::spawn(forward_outbound(ws_tx, outbound_rx));
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let worker = tokio::spawn(
        dispatch_inbound(manager.clone(), conn_id.clone(), inbound_rx).in_current_span(),
    );
    let closed = conn.closed_token();

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => {
                conn.close();
                break;
            }
            () = closed.cancelled() => {
                debug!("connection closed by gateway");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF-8 binary frame ignored");
                    manager.on_activity(&conn_id);
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                manager.on_activity(&conn_id);
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                manager.on_error(&conn_id, &GatewayError::Transport(e.to_string()));
                break;
            }
        };

        // Liveness counts from arrival, not from when the worker gets to it.
        manager.on_activity(&conn_id);
        let queued = tokio::select! {
            () = shutdown.cancelled() => {
                conn.close();
                break;
            }
            () = closed.cancelled() => break,
            sent = inbound_tx.send(text) => sent.is_ok(),
        };
        if !queued {
            break;
        }
    }

    let _ = manager.on_close(&conn_id);
    drop(inbound_tx);
    worker.abort();
    drop(conn);

    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("outbound writer did not drain in time");
        writer.abort();
    }
}

/// Hand queued requests to the manager one at a time.
async fn dispatch_inbound(
    manager: Arc<ConnectionManager>,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(text) = rx.recv().await {
        let _ = manager.on_message(&conn_id, &text).await;
    }
}

/// Copy queued frames onto the socket until the queue closes, a close frame
/// is sent, or the socket rejects a write.
async fn forward_outbound<S>(mut ws_tx: S, mut rx: mpsc::Receiver<OutboundFrame>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text.to_string().into()), false),
            OutboundFrame::Ping => (Message::Ping(Vec::new().into()), false),
            OutboundFrame::Close => (Message::Close(None), true),
        };
        if ws_tx.send(message).await.is_err() || last {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    #[tokio::test]
    async fn writer_maps_frames_and_stops_after_close() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);
        tx.send(OutboundFrame::Text(Arc::new("{\"id\":1}".into()))).await.unwrap();
        tx.send(OutboundFrame::Ping).await.unwrap();
        tx.send(OutboundFrame::Close).await.unwrap();
        tx.send(OutboundFrame::Text(Arc::new("late".into()))).await.unwrap();

        forward_outbound(sink_tx, rx).await;

        let sent: Vec<Message> = sink_rx.collect().await;
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Message::Text(t) if t.as_str() == "{\"id\":1}"));
        assert!(matches!(&sent[1], Message::Ping(p) if p.is_empty()));
        assert!(matches!(&sent[2], Message::Close(None)));
    }

    #[tokio::test]
    async fn writer_exits_when_queue_closes() {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);
        tx.send(OutboundFrame::Text(Arc::new("a".into()))).await.unwrap();
        drop(tx);

        forward_outbound(sink_tx, rx).await;
        let sent: Vec<Message> = sink_rx.collect().await;
        assert_eq!(sent.len(), 1);
    }
}
