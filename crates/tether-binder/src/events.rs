//! Typed lifecycle notifications published by a binder.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::error::BinderError;
use crate::lock;

/// A binder notification.
#[derive(Debug, Clone)]
pub enum BinderEvent {
    /// The binder itself faulted; it is terminal.
    Faulted,
    /// A tolerated channel fault retired the channel; the next operation
    /// opens a replacement.
    ConnectionLost,
    /// An error was rerouted here instead of being returned to a caller.
    Exception(Arc<BinderError>),
}

/// Fan-out of [`BinderEvent`]s to every live subscriber.
///
/// Unbounded queues keep publishing non-blocking; nothing is dropped while a
/// subscriber's receiver is alive.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<BinderEvent>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber that receives every event published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<BinderEvent> {
        let (tx, rx) = unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Delivers `event` to all subscribers, pruning closed ones.
    pub fn publish(&self, event: BinderEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(?event, subscribers = subscribers.len(), "binder event published");
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.publish(BinderEvent::ConnectionLost);
        assert!(matches!(first.recv().await, Some(BinderEvent::ConnectionLost)));
        assert!(matches!(second.recv().await, Some(BinderEvent::ConnectionLost)));
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(BinderEvent::Faulted);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_exception_carries_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BinderEvent::Exception(Arc::new(BinderError::Closed)));
        match rx.try_recv() {
            Ok(BinderEvent::Exception(err)) => assert!(matches!(*err, BinderError::Closed)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
