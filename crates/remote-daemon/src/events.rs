//! Per-instance pub-sub for transcode events.
//!
//! Each instance gets one `tokio::sync::broadcast` channel, created lazily
//! on first subscribe or publish.  A subscription is a plain receiver
//! handle — dropping it unsubscribes, so a torn-down listener can never
//! dangle.  Delivery is isolated per receiver: a lagged or dropped receiver
//! never affects other subscribers or the publisher.

use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use remote_proto::protocol::StreamEvent;

const CHANNEL_CAPACITY: usize = 64;

pub struct EventHub {
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events for one instance.  The channel is created on
    /// demand so listeners may attach before the stream session exists.
    pub async fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event to the instance's current subscribers.  A missing
    /// channel or zero live receivers is not an error.
    pub async fn publish(&self, instance_id: &str, event: StreamEvent) {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(instance_id) {
            if let Err(e) = tx.send(event) {
                debug!(instance_id, "event hub: no receivers ({})", e);
            }
        }
    }

    /// Drop all subscriber state for an instance.  Existing receivers see
    /// the channel close on their next recv.
    pub async fn clear(&self, instance_id: &str) {
        self.channels.lock().await.remove(instance_id);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_proto::protocol::StreamEvent;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = EventHub::new();
        let mut rx1 = hub.subscribe("a").await;
        let mut rx2 = hub.subscribe("a").await;

        hub.publish("a", StreamEvent::Ready).await;

        assert!(matches!(rx1.recv().await.unwrap(), StreamEvent::Ready));
        assert!(matches!(rx2.recv().await.unwrap(), StreamEvent::Ready));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_others() {
        let hub = EventHub::new();
        let rx1 = hub.subscribe("a").await;
        let mut rx2 = hub.subscribe("a").await;
        drop(rx1);

        hub.publish("a", StreamEvent::Ready).await;
        assert!(matches!(rx2.recv().await.unwrap(), StreamEvent::Ready));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = EventHub::new();
        // no channel at all
        hub.publish("missing", StreamEvent::Ready).await;

        // channel exists but all receivers dropped
        drop(hub.subscribe("a").await);
        hub.publish("a", StreamEvent::Ready).await;
    }

    #[tokio::test]
    async fn clear_closes_the_channel() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe("a").await;
        hub.clear("a").await;
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn instances_are_isolated() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe("a").await;
        let _rx_b = hub.subscribe("b").await;

        hub.publish("b", StreamEvent::Ready).await;
        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
