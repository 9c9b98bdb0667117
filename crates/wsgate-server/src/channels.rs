//! Channel subscriptions and publish fan-out.

use std::sync::Arc;

use metrics::{counter, gauge};
use serde_json::Value;
use tracing::{debug, warn};
use wsgate_core::ConnectionId;

use crate::metrics::{CHANNELS_ACTIVE, CHANNEL_DELIVERIES_TOTAL, CHANNEL_DROPS_TOTAL};
use crate::registry::Registry;

/// Named broadcast groups over the shared [`Registry`].
///
/// Cheap to clone; backends hold one to push frames to clients.
#[derive(Clone)]
pub struct ChannelRegistry {
    registry: Arc<Registry>,
}

impl ChannelRegistry {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Subscribe a connection. No-op if already subscribed.
    pub fn subscribe(&self, conn_id: &ConnectionId, channel: &str) -> bool {
        let added = self.registry.subscribe(conn_id, channel);
        if added {
            debug!(conn_id = %conn_id, channel, "subscribed");
            gauge!(CHANNELS_ACTIVE).set(self.registry.channel_count() as f64);
        }
        added
    }

    /// Unsubscribe a connection. No-op if not subscribed.
    pub fn unsubscribe(&self, conn_id: &ConnectionId, channel: &str) -> bool {
        let removed = self.registry.unsubscribe(conn_id, channel);
        if removed {
            debug!(conn_id = %conn_id, channel, "unsubscribed");
            gauge!(CHANNELS_ACTIVE).set(self.registry.channel_count() as f64);
        }
        removed
    }

    /// Drop every subscription of a connection. Returns how many there were.
    pub fn unsubscribe_all(&self, conn_id: &ConnectionId) -> usize {
        let channels = self.registry.unsubscribe_all(conn_id);
        if !channels.is_empty() {
            debug!(conn_id = %conn_id, count = channels.len(), "unsubscribed from all channels");
            gauge!(CHANNELS_ACTIVE).set(self.registry.channel_count() as f64);
        }
        channels.len()
    }

    /// Send `payload` to every subscriber of `channel` not in `exclude`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn publish(&self, channel: &str, payload: &Value, exclude: &[ConnectionId]) -> usize {
        match serde_json::to_string(payload) {
            Ok(json) => self.publish_raw(channel, Arc::new(json), exclude),
            Err(e) => {
                warn!(channel, error = %e, "failed to serialize publish payload");
                0
            }
        }
    }

    /// [`publish`](Self::publish) for an already serialized frame.
    pub fn publish_raw(&self, channel: &str, frame: Arc<String>, exclude: &[ConnectionId]) -> usize {
        let mut delivered = 0usize;
        let mut dropped = 0usize;
        self.registry.for_each_subscriber(channel, |conn| {
            if exclude.contains(&conn.id) || conn.is_closed() {
                return;
            }
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        });
        record_fanout(delivered, dropped);
        debug!(channel, recipients = delivered, dropped, "published");
        delivered
    }

    /// Send `payload` to every live connection not in `exclude`.
    pub fn broadcast(&self, payload: &Value, exclude: &[ConnectionId]) -> usize {
        let frame = match serde_json::to_string(payload) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast payload");
                return 0;
            }
        };
        let mut delivered = 0usize;
        let mut dropped = 0usize;
        self.registry.for_each_connection(|conn| {
            if exclude.contains(&conn.id) || conn.is_closed() {
                return;
            }
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        });
        record_fanout(delivered, dropped);
        debug!(recipients = delivered, dropped, "broadcast to all");
        delivered
    }

    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.registry.subscribers(channel)
    }

    pub fn subscriptions(&self, conn_id: &ConnectionId) -> Vec<String> {
        self.registry.subscriptions(conn_id)
    }

    pub fn channel_count(&self) -> usize {
        self.registry.channel_count()
    }
}

fn record_fanout(delivered: usize, dropped: usize) {
    counter!(CHANNEL_DELIVERIES_TOTAL).increment(delivered as u64);
    if dropped > 0 {
        counter!(CHANNEL_DROPS_TOTAL).increment(dropped as u64);
    }
}
