//! The dispatch loop.
//!
//! A single [`Dispatcher`] drains the inbound queue and fans every message
//! out to a snapshot of the registry. It never waits on a connection: frames
//! are queued with `try_send`, and a connection whose buffer is closed or full
//! is handled according to [`OverflowPolicy`] without holding up the others.

use crate::hub::{Counters, HubConfig, OverflowPolicy};
use crate::message::Message;
use crate::registry::{ConnectionHandle, DeliveryError, Registry};
use relay_protocol::codec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// The hub's dispatch loop. Created by [`crate::Hub::new`].
pub struct Dispatcher {
    registry: Arc<Registry>,
    inbound: mpsc::UnboundedReceiver<Message>,
    config: HubConfig,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<Registry>,
        inbound: mpsc::UnboundedReceiver<Message>,
        config: HubConfig,
        shutdown: CancellationToken,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            registry,
            inbound,
            config,
            shutdown,
            counters,
        }
    }

    /// Run until the hub shuts down, then close every connection.
    pub async fn run(mut self) {
        info!("Dispatch loop started");

        loop {
            let message = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                message = self.inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            self.dispatch(&message);
        }

        let closed = self.registry.close_all();
        info!(closed, "Dispatch loop stopped");
    }

    /// Fan one message out to every registered connection.
    ///
    /// Returns the number of connections the message was queued for.
    pub fn dispatch(&self, message: &Message) -> usize {
        let frame: Arc<str> = match codec::encode(&message.to_wire()) {
            Ok(frame) => frame.into(),
            Err(e) => {
                error!(message_id = message.id(), error = %e, "Failed to encode message");
                return 0;
            }
        };

        let mut delivered = 0;
        for handle in self.registry.snapshot() {
            if !self.config.echo_to_sender && message.is_from(handle.id()) {
                continue;
            }

            match handle.try_deliver(Arc::clone(&frame)) {
                Ok(()) => {
                    delivered += 1;
                    Counters::incr(&self.counters.deliveries);
                }
                Err(DeliveryError::Full) => self.on_overflow(&handle),
                Err(DeliveryError::Closed) => {
                    debug!(connection = %handle.id(), "Target closed, dropping");
                    self.evict(&handle);
                }
            }
        }

        Counters::incr(&self.counters.messages_dispatched);
        trace!(message_id = message.id(), recipients = delivered, "Dispatched");
        delivered
    }

    fn on_overflow(&self, handle: &ConnectionHandle) {
        match self.config.overflow_policy {
            OverflowPolicy::Disconnect => {
                warn!(connection = %handle.id(), "Outbound buffer full, disconnecting");
                Counters::incr(&self.counters.slow_consumers_disconnected);
                self.evict(handle);
            }
            OverflowPolicy::DropMessage => {
                debug!(connection = %handle.id(), "Outbound buffer full, message dropped");
                Counters::incr(&self.counters.deliveries_dropped);
            }
        }
    }

    fn evict(&self, handle: &ConnectionHandle) {
        self.registry.remove(handle);
        handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::handle;
    use relay_transport::ConnectionId;

    fn dispatcher(config: HubConfig) -> (Dispatcher, mpsc::UnboundedSender<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::new(Registry::new()),
            rx,
            config,
            CancellationToken::new(),
            Arc::new(Counters::default()),
        );
        (dispatcher, tx)
    }

    #[test]
    fn test_dispatch_skips_source() {
        let (dispatcher, _tx) = dispatcher(HubConfig::default());
        let (a, mut a_rx) = handle("a", 4);
        let (b, mut b_rx) = handle("b", 4);
        dispatcher.registry.register(a);
        dispatcher.registry.register(b);

        let message = Message::new("A", "hi").with_source(ConnectionId::new("a"));
        assert_eq!(dispatcher.dispatch(&message), 1);

        assert_eq!(&*b_rx.try_recv().unwrap(), r#"{"username":"A","content":"hi"}"#);
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_evicts_closed_target() {
        let (dispatcher, _tx) = dispatcher(HubConfig::default());
        let (a, a_rx) = handle("a", 4);
        let (b, mut b_rx) = handle("b", 4);
        dispatcher.registry.register(a.clone());
        dispatcher.registry.register(b);
        drop(a_rx);

        assert_eq!(dispatcher.dispatch(&Message::new("X", "1")), 1);
        assert!(!dispatcher.registry.contains(a.id()));
        assert!(a.is_closed());
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn test_overflow_disconnect() {
        let (disconnecting, _tx) = dispatcher(HubConfig::default());
        let (a, _a_rx) = handle("a", 1);
        disconnecting.registry.register(a.clone());

        assert_eq!(disconnecting.dispatch(&Message::new("X", "1")), 1);
        assert_eq!(disconnecting.dispatch(&Message::new("X", "2")), 0);
        assert!(a.is_closed());
        assert!(disconnecting.registry.is_empty());
    }

    #[test]
    fn test_overflow_drop_message() {
        let config = HubConfig {
            overflow_policy: OverflowPolicy::DropMessage,
            ..Default::default()
        };
        let (dropping, _tx) = dispatcher(config);
        let (b, mut b_rx) = handle("b", 1);
        dropping.registry.register(b.clone());

        dropping.dispatch(&Message::new("X", "1"));
        dropping.dispatch(&Message::new("X", "2"));
        assert!(!b.is_closed());
        assert!(dropping.registry.contains(b.id()));
        assert_eq!(
            dropping.counters.deliveries_dropped.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(&*b_rx.try_recv().unwrap(), r#"{"username":"X","content":"1"}"#);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (dispatcher, tx) = dispatcher(HubConfig::default());
        let shutdown = dispatcher.shutdown.clone();
        let registry = Arc::clone(&dispatcher.registry);
        let (a, mut a_rx) = handle("a", 4);
        registry.register(a.clone());

        let task = tokio::spawn(dispatcher.run());
        tx.send(Message::new("X", "before")).unwrap();
        assert_eq!(&*a_rx.recv().await.unwrap(), r#"{"username":"X","content":"before"}"#);

        shutdown.cancel();
        task.await.unwrap();
        assert!(registry.is_empty());
        assert!(a.is_closed());
    }
}
