//! Shared connection registry and channel reverse index.
//!
//! Connections and channel membership live under one lock so that a
//! publish never observes a half-removed connection: teardown takes the
//! write lock once, drops every subscription and the connection entry,
//! and releases it. Fan-out holds the read lock while queueing frames,
//! which never blocks (`try_send`).
//!
//! Sets keep insertion order until something is removed; removal swaps the
//! last member into the vacated slot so it stays O(1) under the write lock.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::RwLock;
use wsgate_core::ConnectionId;

use crate::connection::ClientConnection;

struct Entry {
    conn: Arc<ClientConnection>,
    /// Channels this connection subscribed to.
    channels: IndexSet<String>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    /// channel name -> subscribers.
    channels: HashMap<String, IndexSet<ConnectionId>>,
}

impl Inner {
    fn detach(&mut self, id: &ConnectionId, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            let _ = subscribers.swap_remove(id);
            if subscribers.is_empty() {
                let _ = self.channels.remove(channel);
            }
        }
    }
}

/// Owner of every live connection and the channel index.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. Returns `false` if the ID is already taken.
    pub fn insert(&self, conn: Arc<ClientConnection>) -> bool {
        let mut inner = self.inner.write();
        if inner.connections.contains_key(&conn.id) {
            return false;
        }
        let _ = inner.connections.insert(
            conn.id.clone(),
            Entry {
                conn,
                channels: IndexSet::new(),
            },
        );
        true
    }

    /// Unsubscribe a connection from everything and remove it, atomically.
    ///
    /// Returns the connection and the channels it was subscribed to, or
    /// `None` if it was already gone.
    pub fn remove(&self, id: &ConnectionId) -> Option<(Arc<ClientConnection>, Vec<String>)> {
        let mut inner = self.inner.write();
        let entry = inner.connections.remove(id)?;
        for channel in &entry.channels {
            inner.detach(id, channel);
        }
        Some((entry.conn, entry.channels.into_iter().collect()))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().connections.get(id).map(|e| e.conn.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().connections.contains_key(id)
    }

    /// Clone out every live connection. The lock is released on return.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.inner
            .read()
            .connections
            .values()
            .map(|e| e.conn.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.inner.read().channels.len()
    }

    /// Add `id` to `channel`. Returns `true` only if newly subscribed;
    /// unknown connections are ignored.
    pub fn subscribe(&self, id: &ConnectionId, channel: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.connections.get_mut(id) else {
            return false;
        };
        if !entry.channels.insert(channel.to_owned()) {
            return false;
        }
        let _ = inner
            .channels
            .entry(channel.to_owned())
            .or_default()
            .insert(id.clone());
        true
    }

    /// Remove `id` from `channel`. Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner
            .connections
            .get_mut(id)
            .is_some_and(|entry| entry.channels.swap_remove(channel));
        if removed {
            inner.detach(id, channel);
        }
        removed
    }

    /// Drop every subscription of `id`, keeping the connection itself.
    pub fn unsubscribe_all(&self, id: &ConnectionId) -> Vec<String> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.connections.get_mut(id) else {
            return Vec::new();
        };
        let channels: Vec<String> = entry.channels.drain(..).collect();
        for channel in &channels {
            inner.detach(id, channel);
        }
        channels
    }

    /// Channels `id` is subscribed to, in subscription order.
    pub fn subscriptions(&self, id: &ConnectionId) -> Vec<String> {
        self.inner
            .read()
            .connections
            .get(id)
            .map(|e| e.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscriber IDs of `channel`, in subscription order.
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` for each subscriber of `channel` while holding the read lock.
    ///
    /// `f` must not block or re-enter the registry for writing.
    pub fn for_each_subscriber(&self, channel: &str, mut f: impl FnMut(&Arc<ClientConnection>)) {
        let inner = self.inner.read();
        let Some(subscribers) = inner.channels.get(channel) else {
            return;
        };
        for id in subscribers {
            if let Some(entry) = inner.connections.get(id) {
                f(&entry.conn);
            }
        }
    }

    /// Run `f` for every connection while holding the read lock.
    pub fn for_each_connection(&self, mut f: impl FnMut(&Arc<ClientConnection>)) {
        let inner = self.inner.read();
        for entry in inner.connections.values() {
            f(&entry.conn);
        }
    }
}
