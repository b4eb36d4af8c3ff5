//! The connection hub.
//!
//! The hub owns the registry and the sending side of the inbound queue. Every
//! accepted connection gets a read loop, which feeds the inbound queue, and a
//! writer, which drains the connection's outbound buffer. The [`Dispatcher`]
//! sits between the two.

use crate::dispatch::Dispatcher;
use crate::message::Message;
use crate::registry::{ConnectionHandle, Registry};
use relay_transport::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub no longer accepts connections.
    #[error("Hub is shutting down")]
    ShuttingDown,

    /// Another live connection is registered under the same ID.
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// What the dispatch loop does when a connection's outbound buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Unregister and close the slow connection.
    #[default]
    Disconnect,
    /// Skip the message for the slow connection only.
    DropMessage,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per connection between the dispatch loop and the writer.
    pub outbound_capacity: usize,
    /// Policy applied when an outbound buffer is full.
    pub overflow_policy: OverflowPolicy,
    /// Whether a sender receives its own messages back.
    pub echo_to_sender: bool,
    /// How long a writer may spend closing its transport.
    pub close_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow_policy: OverflowPolicy::Disconnect,
            echo_to_sender: false,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a connection's read loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// The peer sent a payload that is not a valid message.
    Malformed,
    /// The transport failed.
    Transport,
    /// The hub closed the connection after a failed or overflowing delivery.
    ClosedByHub,
    /// The hub is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Malformed => "malformed",
            Self::Transport => "transport",
            Self::ClosedByHub => "closed_by_hub",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) connections_accepted: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) messages_dispatched: AtomicU64,
    pub(crate) deliveries: AtomicU64,
    pub(crate) deliveries_dropped: AtomicU64,
    pub(crate) slow_consumers_disconnected: AtomicU64,
    pub(crate) send_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Connections accepted since start.
    pub connections_accepted: u64,
    /// Messages decoded by read loops.
    pub messages_received: u64,
    /// Messages fanned out by the dispatch loop.
    pub messages_dispatched: u64,
    /// Frames queued for connections.
    pub deliveries: u64,
    /// Frames skipped under [`OverflowPolicy::DropMessage`].
    pub deliveries_dropped: u64,
    /// Connections closed under [`OverflowPolicy::Disconnect`].
    pub slow_consumers_disconnected: u64,
    /// Connections closed because a write to them failed.
    pub send_failures: u64,
}

/// A connection that has been registered but whose read loop has not run yet.
struct Attached {
    handle: ConnectionHandle,
    stream: Box<dyn MessageStream>,
    writer: JoinHandle<()>,
}

/// The connection hub.
pub struct Hub {
    registry: Arc<Registry>,
    inbound: mpsc::UnboundedSender<Message>,
    config: HubConfig,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl Hub {
    /// Create a hub and the dispatcher that serves it.
    ///
    /// The dispatcher must be run (see [`Dispatcher::run`]) for messages to
    /// flow.
    #[must_use]
    pub fn new(config: HubConfig) -> (Arc<Self>, Dispatcher) {
        info!("Creating hub with config: {:?}", config);

        let registry = Arc::new(Registry::new());
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            inbound_rx,
            config.clone(),
            shutdown.clone(),
            Arc::clone(&counters),
        );

        let hub = Arc::new(Self {
            registry,
            inbound,
            config,
            shutdown,
            counters,
        });

        (hub, dispatcher)
    }

    /// Create a hub and spawn its dispatcher on the current runtime.
    #[must_use]
    pub fn start(config: HubConfig) -> (Arc<Self>, JoinHandle<()>) {
        let (hub, dispatcher) = Self::new(config);
        let handle = tokio::spawn(dispatcher.run());
        (hub, handle)
    }

    /// The hub's registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The hub's configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let c = &self.counters;
        HubStats {
            connection_count: self.registry.len(),
            connections_accepted: c.connections_accepted.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            messages_dispatched: c.messages_dispatched.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            deliveries_dropped: c.deliveries_dropped.load(Ordering::Relaxed),
            slow_consumers_disconnected: c.slow_consumers_disconnected.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether [`Hub::shutdown`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the hub: the dispatch loop, every read loop and every writer exit
    /// and all connections are closed.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(connections = self.registry.len(), "Hub shutting down");
        }
        self.shutdown.cancel();
    }

    /// Completes once [`Hub::shutdown`] has been called.
    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await;
    }

    /// Register a connection and spawn its read loop.
    ///
    /// The connection is registered when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShuttingDown`] once the hub has been shut down and
    /// [`HubError::DuplicateConnection`] if the connection's ID is taken.
    pub fn accept(self: &Arc<Self>, connection: Box<dyn Connection>) -> Result<ConnectionId, HubError> {
        let attached = self.attach(connection)?;
        let id = attached.handle.id().clone();

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.drive(attached).await;
        });

        Ok(id)
    }

    /// Register a connection and run its read loop until it terminates.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShuttingDown`] once the hub has been shut down and
    /// [`HubError::DuplicateConnection`] if the connection's ID is taken.
    pub async fn run_connection(
        &self,
        connection: Box<dyn Connection>,
    ) -> Result<CloseReason, HubError> {
        let attached = self.attach(connection)?;
        Ok(self.drive(attached).await)
    }

    fn attach(&self, connection: Box<dyn Connection>) -> Result<Attached, HubError> {
        if self.is_shutdown() {
            return Err(HubError::ShuttingDown);
        }

        let id = connection.id().clone();
        let remote_addr = connection.remote_addr();
        let (stream, sink) = connection.split();

        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let handle = ConnectionHandle::new(
            id.clone(),
            outbound,
            self.shutdown.child_token(),
            remote_addr,
        );

        if !self.registry.register(handle.clone()) {
            warn!(connection = %id, "Connection ID already registered, rejecting");
            let close_timeout = self.config.close_timeout;
            let mut sink = sink;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(close_timeout, sink.close()).await;
            });
            return Err(HubError::DuplicateConnection(id));
        }
        Counters::incr(&self.counters.connections_accepted);

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            handle.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.counters),
            self.config.close_timeout,
        ));

        debug!(
            connection = %id,
            remote = handle.remote_addr().unwrap_or("-"),
            "Connection attached"
        );

        Ok(Attached {
            handle,
            stream,
            writer,
        })
    }

    async fn drive(&self, attached: Attached) -> CloseReason {
        let Attached {
            handle,
            mut stream,
            writer,
        } = attached;

        let reason = self.read_loop(stream.as_mut(), &handle).await;

        self.registry.remove(&handle);
        handle.close();

        if let Err(e) = writer.await {
            warn!(connection = %handle.id(), error = %e, "Writer task failed");
        }

        debug!(connection = %handle.id(), reason = reason.as_str(), "Connection terminated");
        reason
    }

    /// Receive messages until the connection fails or is closed.
    async fn read_loop(&self, stream: &mut dyn MessageStream, handle: &ConnectionHandle) -> CloseReason {
        loop {
            let received = tokio::select! {
                biased;

                _ = handle.closed() => {
                    return if self.is_shutdown() {
                        CloseReason::Shutdown
                    } else {
                        CloseReason::ClosedByHub
                    };
                }

                received = stream.recv() => received,
            };

            match received {
                Ok(Some(wire)) => {
                    let message = Message::from(wire).with_source(handle.id().clone());
                    Counters::incr(&self.counters.messages_received);
                    if self.inbound.send(message).is_err() {
                        // Dispatcher is gone
                        return CloseReason::Shutdown;
                    }
                }
                Ok(None) => return CloseReason::PeerClosed,
                Err(TransportError::Protocol(e)) if e.is_malformed_input() => {
                    warn!(connection = %handle.id(), error = %e, "Malformed message");
                    return CloseReason::Malformed;
                }
                Err(e) => {
                    warn!(connection = %handle.id(), kind = e.kind(), error = %e, "Receive failed");
                    return CloseReason::Transport;
                }
            }
        }
    }
}

/// Drain a connection's outbound buffer into its sink.
///
/// This is the only task that writes to the sink.
async fn write_loop(
    mut sink: Box<dyn MessageSink>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    handle: ConnectionHandle,
    registry: Arc<Registry>,
    counters: Arc<Counters>,
    close_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = handle.closed() => break,

            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;

            _ = handle.closed() => break,

            sent = sink.send_raw(&frame) => sent,
        };

        if let Err(e) = sent {
            debug!(connection = %handle.id(), kind = e.kind(), error = %e, "Send failed");
            Counters::incr(&counters.send_failures);
            registry.remove(&handle);
            handle.close();
            break;
        }
    }

    match tokio::time::timeout(close_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(connection = %handle.id(), kind = e.kind(), error = %e, "Close failed"),
        Err(_) => debug!(connection = %handle.id(), "Close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ChatMessage;
    use relay_transport::memory::{self, MemoryClient};

    const WAIT: Duration = Duration::from_secs(5);

    fn connect(hub: &Arc<Hub>) -> MemoryClient {
        let (conn, client) = memory::pair();
        hub.accept(Box::new(conn)).unwrap();
        client
    }

    async fn recv(client: &mut MemoryClient) -> ChatMessage {
        tokio::time::timeout(WAIT, client.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_but_sender() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let mut a = connect(&hub);
        let mut b = connect(&hub);
        let mut c = connect(&hub);

        a.send(&ChatMessage::new("A", "hi")).unwrap();

        assert_eq!(recv(&mut b).await, ChatMessage::new("A", "hi"));
        assert_eq!(recv(&mut c).await, ChatMessage::new("A", "hi"));
        assert!(a.try_recv_raw().is_none());
        assert!(hub.registry().contains(a.id()));

        // Next message is the next one, not a duplicate
        a.send(&ChatMessage::new("A", "again")).unwrap();
        assert_eq!(recv(&mut b).await.content, "again");
        assert_eq!(recv(&mut c).await.content, "again");
        assert!(a.try_recv_raw().is_none());
    }

    #[tokio::test]
    async fn test_echo_to_sender() {
        let config = HubConfig {
            echo_to_sender: true,
            ..Default::default()
        };
        let (hub, _dispatch) = Hub::start(config);
        let mut a = connect(&hub);
        let mut b = connect(&hub);

        a.send(&ChatMessage::new("A", "hi")).unwrap();

        assert_eq!(recv(&mut a).await, ChatMessage::new("A", "hi"));
        assert_eq!(recv(&mut b).await, ChatMessage::new("A", "hi"));
        assert!(a.try_recv_raw().is_none());
    }

    #[tokio::test]
    async fn test_sender_order_preserved() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let a = connect(&hub);
        let mut b = connect(&hub);

        for i in 0..50 {
            a.send(&ChatMessage::new("A", i.to_string())).unwrap();
        }
        for i in 0..50 {
            assert_eq!(recv(&mut b).await.content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_disconnected_client_is_unregistered() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let a = connect(&hub);
        let mut b = connect(&hub);
        let mut c = connect(&hub);

        c.close();
        let c_id = c.id().clone();
        wait_until(|| !hub.registry().contains(&c_id)).await;
        assert_eq!(hub.connection_count(), 2);

        let before = hub.stats().deliveries;
        a.send(&ChatMessage::new("A", "after")).unwrap();
        assert_eq!(recv(&mut b).await.content, "after");
        assert_eq!(hub.stats().deliveries, before + 1);

        // The hub closed its side too
        assert!(tokio::time::timeout(WAIT, c.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_payload_terminates_only_sender() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let a = connect(&hub);
        let mut b = connect(&hub);
        let mut c = connect(&hub);

        b.send_text(r#"{"username":"B"}"#).unwrap();
        let b_id = b.id().clone();
        wait_until(|| !hub.registry().contains(&b_id)).await;

        a.send(&ChatMessage::new("A", "still here")).unwrap();
        assert_eq!(recv(&mut c).await.content, "still here");
        assert!(tokio::time::timeout(WAIT, b.recv()).await.unwrap().is_none());
        assert!(hub.registry().contains(a.id()));
    }

    #[tokio::test]
    async fn test_forcibly_closed_transport() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let a = connect(&hub);
        let b = connect(&hub);
        let mut c = connect(&hub);
        let b_id = b.id().clone();

        drop(b);

        a.send(&ChatMessage::new("A", "who is left")).unwrap();
        assert_eq!(recv(&mut c).await.content, "who is left");

        wait_until(|| !hub.registry().contains(&b_id)).await;
        assert_eq!(hub.connection_count(), 2);
    }

    /// A memory connection that reports a chosen ID.
    struct FixedId {
        id: ConnectionId,
        inner: memory::MemoryConnection,
    }

    impl Connection for FixedId {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn split(self: Box<Self>) -> (Box<dyn MessageStream>, Box<dyn MessageSink>) {
            let this = *self;
            Box::new(this.inner).split()
        }
    }

    fn connect_as(hub: &Arc<Hub>, id: &str) -> (Result<ConnectionId, HubError>, MemoryClient) {
        let (inner, client) = memory::pair();
        let conn = FixedId {
            id: ConnectionId::new(id),
            inner,
        };
        (hub.accept(Box::new(conn)), client)
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());
        let (first, mut original) = connect_as(&hub, "dup");
        assert_eq!(first.unwrap(), ConnectionId::new("dup"));

        let (second, mut duplicate) = connect_as(&hub, "dup");
        assert!(matches!(second, Err(HubError::DuplicateConnection(id)) if id.as_str() == "dup"));
        assert!(tokio::time::timeout(WAIT, duplicate.recv()).await.unwrap().is_none());
        drop(duplicate);

        let c = connect(&hub);
        assert_eq!(hub.connection_count(), 2);

        // The rejected connection going away leaves the original registered
        c.send(&ChatMessage::new("C", "still yours")).unwrap();
        assert_eq!(recv(&mut original).await.content, "still yours");
        assert!(hub.registry().contains(&ConnectionId::new("dup")));
        assert_eq!(hub.stats().connections_accepted, 2);
    }

    #[tokio::test]
    async fn test_run_connection_reports_reason() {
        let (hub, _dispatch) = Hub::start(HubConfig::default());

        let (conn, client) = memory::pair();
        client.send_text("garbage").unwrap();
        assert_eq!(
            hub.run_connection(Box::new(conn)).await.unwrap(),
            CloseReason::Malformed
        );

        let (conn, mut client) = memory::pair();
        client.close();
        assert_eq!(
            hub.run_connection(Box::new(conn)).await.unwrap(),
            CloseReason::PeerClosed
        );
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_slow_consumer_disconnected() {
        let config = HubConfig {
            outbound_capacity: 2,
            ..Default::default()
        };
        let (hub, _dispatch) = Hub::start(config);
        let a = connect(&hub);
        let mut fast = connect(&hub);

        let (conn, mut slow) = memory::pair_with_buffer(1);
        let slow_id = hub.accept(Box::new(conn)).unwrap();

        for i in 0..10 {
            a.send(&ChatMessage::new("A", i.to_string())).unwrap();
            assert_eq!(recv(&mut fast).await.content, i.to_string());
        }

        wait_until(|| !hub.registry().contains(&slow_id)).await;
        assert!(hub.stats().slow_consumers_disconnected >= 1);
        assert!(hub.registry().contains(fast.id()));

        // Whatever was buffered before the eviction, the stream then ends
        let drained = tokio::time::timeout(WAIT, async {
            let mut n = 0;
            while slow.recv().await.is_some() {
                n += 1;
            }
            n
        })
        .await
        .unwrap();
        assert!(drained < 10);
    }

    #[tokio::test]
    async fn test_slow_consumer_drop_message_policy() {
        let config = HubConfig {
            outbound_capacity: 2,
            overflow_policy: OverflowPolicy::DropMessage,
            ..Default::default()
        };
        let (hub, _dispatch) = Hub::start(config);
        let a = connect(&hub);
        let mut fast = connect(&hub);

        let (conn, mut slow) = memory::pair_with_buffer(1);
        let slow_id = hub.accept(Box::new(conn)).unwrap();

        for i in 0..10 {
            a.send(&ChatMessage::new("A", i.to_string())).unwrap();
            assert_eq!(recv(&mut fast).await.content, i.to_string());
        }

        assert!(hub.registry().contains(&slow_id));
        assert!(hub.stats().deliveries_dropped >= 6);

        // The slow client keeps its connection and gets the first message
        assert_eq!(recv(&mut slow).await.content, "0");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_during_broadcast() {
        let (hub, dispatch) = Hub::start(HubConfig::default());
        let sender = connect(&hub);
        let mut listener = connect(&hub);

        let mut churn = Vec::new();
        for _ in 0..16 {
            let hub = Arc::clone(&hub);
            churn.push(tokio::spawn(async move {
                let mut survivors = Vec::new();
                for i in 0..25 {
                    let (conn, client) = memory::pair();
                    hub.accept(Box::new(conn)).unwrap();
                    if i % 5 == 0 {
                        survivors.push(client);
                    } else {
                        drop(client);
                    }
                    tokio::task::yield_now().await;
                }
                survivors
            }));
        }

        for i in 0..100 {
            sender.send(&ChatMessage::new("S", i.to_string())).unwrap();
        }

        let mut survivors = Vec::new();
        for task in churn {
            survivors.extend(task.await.unwrap());
        }

        for i in 0..100 {
            assert_eq!(recv(&mut listener).await.content, i.to_string());
        }

        // Survivors are registered exactly once, everyone else is gone
        let expected = 2 + survivors.len();
        wait_until(|| hub.connection_count() == expected).await;
        for client in &survivors {
            assert!(hub.registry().contains(client.id()));
        }
        assert!(!dispatch.is_finished());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (hub, dispatch) = Hub::start(HubConfig::default());
        let mut a = connect(&hub);
        let mut b = connect(&hub);

        hub.shutdown();

        tokio::time::timeout(WAIT, dispatch).await.unwrap().unwrap();
        assert!(tokio::time::timeout(WAIT, a.recv()).await.unwrap().is_none());
        assert!(tokio::time::timeout(WAIT, b.recv()).await.unwrap().is_none());
        assert!(hub.registry().is_empty());

        let (conn, _client) = memory::pair();
        assert!(matches!(
            hub.accept(Box::new(conn)),
            Err(HubError::ShuttingDown)
        ));
    }
}
