use tokio::sync::broadcast;

/// Node-wide event bus.
///
/// Components publish state changes here instead of calling back into each
/// other; subscribers get their own receiver. Ordering is per-publisher,
/// lagging receivers drop the oldest events (broadcast semantics).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    BlockAccepted { height: u64, hash: String },
    BlockMined { height: u64, hash: String },
    TransactionAccepted { id: String },
    TransactionRejected { id: String, reason: String },
    /// A queued message was evicted or expired before transmission.
    MessageDropped { message_id: String, reason: String },
    /// Reliable delivery exhausted its retries; the payload moved to
    /// the dead-letter queue.
    DeliveryFailed { message_id: String },
    DeliveryConfirmed { message_id: String },
    RouteDiscovered { destination: String, next_hop: String, hop_count: u8 },
    RouteLost { destination: String },
    NeighborEvicted { node_id: String },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. A send error only means nobody is
    /// currently subscribed.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(NodeEvent::TransactionAccepted { id: "tx1".into() });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, NodeEvent::TransactionAccepted { id: "tx1".into() });
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(NodeEvent::RouteLost { destination: "x".into() });
    }
}
