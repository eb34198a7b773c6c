//! Client Channels
//!
//! One bounded outbound queue per connection. The connection task owns the
//! receiving half and the [`ChannelGuard`]; dropping the guard unsubscribes
//! the connection, so a queue never outlives its socket.
//!
//! Delivery never waits. A connection whose queue is full has stopped
//! reading; it is unsubscribed and parked in the overflow set until the hub
//! tears it down. Either way of closing wakes the guard's [`ChannelGuard::closed`].

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::network::protocol::{Outbound, ServerMessage};
use crate::network::registry::ConnectionId;

/// Default per-connection queue depth.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

struct Subscriber {
    tx: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
}

/// Outbound queues for every live connection.
pub struct ClientChannels {
    senders: DashMap<ConnectionId, Subscriber>,
    overflowed: DashSet<ConnectionId>,
    capacity: usize,
}

impl ClientChannels {
    /// Create with the given queue depth (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            overflowed: DashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a queue for a new connection.
    pub fn open(self: &Arc<Self>) -> (ChannelGuard, mpsc::Receiver<Outbound>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.capacity);
        let kick = Arc::new(Notify::new());
        self.senders.insert(conn, Subscriber { tx, kick: kick.clone() });

        let guard = ChannelGuard {
            conn,
            kick,
            channels: Arc::clone(self),
        };
        (guard, rx)
    }

    /// Stop delivering to `conn`. Its receiver ends once queued items drain.
    pub fn close(&self, conn: ConnectionId) {
        if let Some((_, sub)) = self.senders.remove(&conn) {
            sub.kick.notify_one();
            debug!(%conn, "Outbound channel closed");
        }
    }

    /// Queue an event for one connection. Returns false if it is gone or
    /// was dropped for falling behind.
    pub fn send_to(&self, conn: ConnectionId, msg: ServerMessage) -> bool {
        self.deliver(conn, Outbound::Event(msg))
    }

    /// Queue an event for every connection not in `except`.
    pub fn broadcast_except(&self, except: &[ConnectionId], msg: ServerMessage) {
        let targets: Vec<_> = self
            .senders
            .iter()
            .filter(|entry| !except.contains(entry.key()))
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        for (conn, tx) in targets {
            self.try_push(conn, &tx, Outbound::Event(msg.clone()));
        }
    }

    /// Connections dropped for a full queue since the last call.
    pub fn drain_overflowed(&self) -> Vec<ConnectionId> {
        let parked: Vec<ConnectionId> = self.overflowed.iter().map(|conn| *conn).collect();
        parked
            .into_iter()
            .filter(|conn| self.overflowed.remove(conn).is_some())
            .collect()
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// No live connections.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn deliver(&self, conn: ConnectionId, out: Outbound) -> bool {
        let Some(tx) = self.senders.get(&conn).map(|sub| sub.tx.clone()) else {
            debug!(%conn, "Dropping outbound message for closed connection");
            return false;
        };
        self.try_push(conn, &tx, out)
    }

    fn try_push(&self, conn: ConnectionId, tx: &mpsc::Sender<Outbound>, out: Outbound) -> bool {
        match tx.try_send(out) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict_slow(conn);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn evict_slow(&self, conn: ConnectionId) {
        if let Some((_, sub)) = self.senders.remove(&conn) {
            warn!(%conn, capacity = self.capacity, "Outbound queue full, dropping connection");
            sub.kick.notify_one();
            self.overflowed.insert(conn);
        }
    }
}

impl Default for ClientChannels {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Subscription handle held by a connection task.
pub struct ChannelGuard {
    conn: ConnectionId,
    kick: Arc<Notify>,
    channels: Arc<ClientChannels>,
}

impl ChannelGuard {
    /// Connection this guard belongs to.
    pub fn id(&self) -> ConnectionId {
        self.conn
    }

    /// Queue a reply on the same queue as events. Returns false if the
    /// connection is gone or was dropped for falling behind.
    pub fn reply(&self, out: Outbound) -> bool {
        self.channels.deliver(self.conn, out)
    }

    /// Resolves once the hub has stopped delivering to this connection.
    pub async fn closed(&self) {
        self.kick.notified().await;
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.channels.close(self.conn);
    }
}
