//! Registry of active client connections.
//!
//! Shared between the accept loop, which registers connections, and the
//! handler tasks, which deregister themselves by dropping their
//! [`ConnectionSlot`]. Slab allocation gives O(1) insert and remove.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Bookkeeping for one live connection.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

/// Set of connections whose handlers are still running.
#[derive(Debug, Default)]
pub struct ActiveConnections {
    connections: Mutex<Slab<ActiveConnection>>,
    emptied: Notify,
}

impl ActiveConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection. It stays registered until the returned slot
    /// is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionSlot {
        let id = self.lock().insert(ActiveConnection {
            peer,
            connected_at: Instant::now(),
        });
        trace!(id, peer = %peer, "Connection registered");
        ConnectionSlot {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove(&self, id: usize) {
        let mut connections = self.lock();
        if let Some(conn) = connections.try_remove(id) {
            trace!(
                id,
                peer = %conn.peer,
                duration_ms = conn.connected_at.elapsed().as_millis() as u64,
                "Connection deregistered"
            );
        }
        if connections.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until every registered connection has finished.
    pub async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            tokio::pin!(emptied);
            // Register interest before checking so a concurrent removal
            // can't be missed
            emptied.as_mut().enable();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    /// Wait for connections to finish, giving up after `timeout`.
    ///
    /// Returns `true` if the set drained in time.
    pub async fn wait_empty_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_empty()).await.is_ok(),
            None => {
                self.wait_empty().await;
                true
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<ActiveConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one connection in [`ActiveConnections`].
///
/// Dropping the slot removes the connection, so a terminated handler can
/// never be left in the set.
#[derive(Debug)]
pub struct ConnectionSlot {
    registry: Arc<ActiveConnections>,
    id: usize,
}

impl ConnectionSlot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
