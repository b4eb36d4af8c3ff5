//! Registry of live connections.
//!
//! The registry only tracks membership. Each entry is a cheap handle holding
//! the connection's outbound buffer and close signal; the connection itself is
//! owned by its read loop and writer.

use dashmap::DashMap;
use relay_transport::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

/// Why a frame could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection's outbound buffer is full.
    #[error("Outbound buffer full")]
    Full,

    /// The connection's writer is gone.
    #[error("Connection closed")]
    Closed,
}

struct HandleInner {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<str>>,
    close: CancellationToken,
    closed: AtomicBool,
    remote_addr: Option<String>,
}

/// Handle to a registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        outbound: mpsc::Sender<Arc<str>>,
        close: CancellationToken,
        remote_addr: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                outbound,
                close,
                closed: AtomicBool::new(false),
                remote_addr,
            }),
        }
    }

    /// The connection's ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// The peer address, if the transport reported one.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.inner.remote_addr.as_deref()
    }

    /// Queue an encoded frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Full`] if the outbound buffer is saturated and
    /// [`DeliveryError::Closed`] if the connection is closed.
    pub fn try_deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Signal the connection's read loop and writer to stop.
    ///
    /// Returns `true` only for the call that actually closed the connection.
    pub fn close(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.close.cancel();
        if first {
            trace!(connection = %self.inner.id, "Close signalled");
        }
        first
    }

    /// Whether the connection has been closed, either directly or by hub
    /// shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.close.is_cancelled()
    }

    /// Whether both handles refer to the same registration.
    #[must_use]
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Completes once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.close.cancelled()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The set of currently registered connections.
///
/// All operations are safe to call concurrently from any task.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    ///
    /// Registering an ID that is already present keeps the existing entry and
    /// returns `false`.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id().clone();
        let mut added = false;
        self.connections.entry(id.clone()).or_insert_with(|| {
            added = true;
            handle
        });
        if added {
            debug!(connection = %id, connections = self.connections.len(), "Registered");
        }
        added
    }

    /// Remove a connection, returning its handle if it was present.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(connection = %id, connections = self.connections.len(), "Unregistered");
        }
        removed
    }

    /// Remove this exact registration.
    ///
    /// Unlike [`Registry::unregister`], an entry registered under the same ID
    /// by a different handle is left in place. Returns `true` if the handle
    /// was removed.
    pub fn remove(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(handle.id(), |_, registered| registered.same_as(handle))
            .is_some();
        if removed {
            debug!(connection = %handle.id(), connections = self.connections.len(), "Unregistered");
        }
        removed
    }

    /// Point-in-time copy of the current membership.
    ///
    /// Later registrations and removals do not affect the returned list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Check whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// IDs of all registered connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Unregister and close every connection. Returns how many were removed.
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for id in self.ids() {
            if let Some(handle) = self.unregister(&id) {
                handle.close();
                count += 1;
            }
        }
        count
    }
}
