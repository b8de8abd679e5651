//! Per-room text chat: a broadcast bus with bounded per-subscriber queues.
//!
//! One event loop per hub drains the register, unregister, and broadcast
//! inboxes serially, which makes set mutations and broadcasts linearizable.
//! A subscriber that cannot keep up loses its queue and is dropped rather
//! than ever blocking the broadcaster.

use std::collections::HashMap;
use std::sync::Arc;

use enclose::enc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws::{self, Opcode, WebSocket};

/// Depth of each subscriber's outbound queue. A full queue at broadcast
/// time disconnects the subscriber.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Handle to a room's chat bus. Cloning shares the same event loop.
#[derive(Debug, Clone)]
pub struct Hub {
    register_tx: mpsc::UnboundedSender<Subscription>,
    unregister_tx: mpsc::UnboundedSender<Uuid>,
    broadcast_tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug)]
struct Subscription {
    id: Uuid,
    queue: mpsc::Sender<String>,
}

impl Hub {
    pub fn new() -> Hub {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            Hub::run(register_rx, unregister_rx, broadcast_rx).await;
        });

        Hub { register_tx, unregister_tx, broadcast_tx }
    }

    /// Adds a subscriber. Registering the same id again replaces its queue,
    /// so repeated registration is idempotent.
    pub fn register(&self, id: Uuid, queue: mpsc::Sender<String>) {
        let _ = self.register_tx.send(Subscription { id, queue });
    }

    /// Removes a subscriber and closes its queue. Safe to call repeatedly;
    /// only the first call closes anything.
    pub fn unregister(&self, id: Uuid) {
        let _ = self.unregister_tx.send(id);
    }

    /// Queues a message for every current subscriber.
    pub fn broadcast(&self, message: String) {
        let _ = self.broadcast_tx.send(message);
    }

    async fn run(
        mut register_rx: mpsc::UnboundedReceiver<Subscription>,
        mut unregister_rx: mpsc::UnboundedReceiver<Uuid>,
        mut broadcast_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut subscribers: HashMap<Uuid, mpsc::Sender<String>> = HashMap::new();

        loop {
            // Membership changes queued before a broadcast take effect first.
            tokio::select! {
                biased;
                Some(subscription) = register_rx.recv() => {
                    subscribers.insert(subscription.id, subscription.queue);
                }
                Some(id) = unregister_rx.recv() => {
                    subscribers.remove(&id);
                }
                Some(message) = broadcast_rx.recv() => {
                    // Non-blocking fan-out: a subscriber whose queue is full
                    // (or already gone) is dropped before we move on.
                    subscribers.retain(|id, queue| match queue.try_send(message.clone()) {
                        Ok(()) => true,
                        Err(_) => {
                            tracing::debug!("chat subscriber {} dropped, queue unavailable", id);
                            false
                        }
                    });
                }
                else => break,
            }
        }
        tracing::debug!("chat hub event loop finished");
    }
}

impl Default for Hub {
    fn default() -> Hub {
        Hub::new()
    }
}

/// Runs a chat connection against a room's hub: a writer task drains the
/// subscriber queue into text frames, the read loop publishes inbound text
/// to the hub. Either side failing unregisters the subscriber.
pub async fn peer_chat_conn(socket: Arc<WebSocket>, hub: Hub) {
    let id = Uuid::new_v4();
    let (queue_tx, mut queue_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);
    hub.register(id, queue_tx);
    tracing::debug!("chat subscriber {} registered", id);

    let writer = tokio::spawn(enc!((socket) async move {
        while let Some(text) = queue_rx.recv().await {
            if let Err(err) = socket.write_message(Opcode::Text, text.as_bytes()).await {
                tracing::debug!("chat writer for {} stopped: {}", id, err);
                return;
            }
        }
        // The hub closed the queue; say goodbye before hanging up.
        let _ = socket.send_close(ws::CLOSE_NORMAL_CLOSURE, "").await;
    }));

    loop {
        match socket.read_message().await {
            Ok(message) if message.is_text() => {
                hub.broadcast(String::from_utf8_lossy(&message.data).into_owned());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!("chat reader for {} stopped: {}", id, err);
                break;
            }
        }
    }

    hub.unregister(id);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_once() {
        let hub = Hub::new();
        let mut queues = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
            hub.register(Uuid::new_v4(), tx);
            queues.push(rx);
        }

        hub.broadcast("hi".to_owned());

        for rx in &mut queues {
            assert_eq!(recv(rx).await.as_deref(), Some("hi"));
            // Exactly once: nothing else is queued.
            assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_pruned_before_the_next_delivery() {
        let hub = Hub::new();

        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let slow_id = Uuid::new_v4();
        hub.register(slow_id, slow_tx);

        let (fast_tx, mut fast_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        hub.register(Uuid::new_v4(), fast_tx);

        // First broadcast fills the slow queue; the second finds it full and
        // drops the subscriber, closing its queue.
        hub.broadcast("one".to_owned());
        hub.broadcast("two".to_owned());
        hub.broadcast("three".to_owned());

        assert_eq!(recv(&mut fast_rx).await.as_deref(), Some("one"));
        assert_eq!(recv(&mut fast_rx).await.as_deref(), Some("two"));
        assert_eq!(recv(&mut fast_rx).await.as_deref(), Some("three"));

        assert_eq!(recv(&mut slow_rx).await.as_deref(), Some("one"));
        // Queue closed after the drop: no "two", no "three", just the end.
        assert_eq!(recv(&mut slow_rx).await, None);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        hub.register(id, tx);

        hub.unregister(id);
        hub.unregister(id);
        hub.broadcast("after".to_owned());

        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn reregistration_replaces_the_queue() {
        let hub = Hub::new();
        let id = Uuid::new_v4();

        let (first_tx, mut first_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        hub.register(id, first_tx);
        let (second_tx, mut second_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        hub.register(id, second_tx);

        hub.broadcast("hello".to_owned());

        assert_eq!(recv(&mut second_rx).await.as_deref(), Some("hello"));
        assert_eq!(recv(&mut first_rx).await, None);
    }
}
