//! Order event notifications.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::ChannelId;
use crate::order::{Operation, Order};
use crate::types::PeerId;

/// An order operation that was applied locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderEvent {
    pub operation: Operation,
    pub channel_id: ChannelId,
    pub order: Order,
    /// Node the operation came from; our own id for local operations.
    pub origin: PeerId,
}

/// Sink for [`OrderEvent`]s. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: OrderEvent);
}

/// [`Notifier`] fanning events out on a tokio broadcast channel.
///
/// Slow subscribers lag and skip events rather than blocking the node.
#[derive(Clone)]
pub struct OrderFeed {
    tx: broadcast::Sender<OrderEvent>,
}

impl OrderFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for OrderFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for OrderFeed {
    fn notify(&self, event: OrderEvent) {
        tracing::trace!(operation = ?event.operation, order = %event.order.id, "order event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: OrderEvent) {}
}
