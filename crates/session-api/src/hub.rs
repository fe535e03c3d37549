//! Per-room broadcast fan-out. Topic-keyed channels with a bounded buffer;
//! a subscriber that falls behind observes a lag error and must resubscribe
//! for a fresh snapshot, so publishers never stall on slow consumers.

use std::collections::HashMap;

use contracts::StreamMessage;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug)]
pub struct RoomHub {
    channels: RwLock<HashMap<String, broadcast::Sender<StreamMessage>>>,
    capacity: usize,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Publishes a committed broadcast. A room with no subscribers is a
    /// no-op.
    pub async fn publish(&self, room_id: &str, message: StreamMessage) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(room_id) {
            let _ = tx.send(message);
        }
    }

    pub async fn subscribe(&self, room_id: &str) -> broadcast::Receiver<StreamMessage> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    pub async fn subscriber_count(&self, room_id: &str) -> usize {
        self.channels
            .read()
            .await
            .get(room_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drops channels nobody listens to.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::PlayerRoster;
    use serde_json::json;

    fn message(version: u64) -> StreamMessage {
        StreamMessage::snapshot(json!({"v": version}), PlayerRoster::new(), version)
    }

    #[tokio::test]
    async fn publish_reaches_room_subscribers_in_order() {
        let hub = RoomHub::new(16);
        let mut rx = hub.subscribe("room_a").await;
        hub.publish("room_a", message(1)).await;
        hub.publish("room_a", message(2)).await;

        assert_eq!(rx.recv().await.expect("first").version, 1);
        assert_eq!(rx.recv().await.expect("second").version, 2);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let hub = RoomHub::new(16);
        let mut rx_a = hub.subscribe("room_a").await;
        let _rx_b = hub.subscribe("room_b").await;

        hub.publish("room_b", message(9)).await;
        hub.publish("room_a", message(1)).await;
        assert_eq!(rx_a.recv().await.expect("own message").version, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let hub = RoomHub::new(16);
        hub.publish("nobody", message(1)).await;
    }

    #[tokio::test]
    async fn slow_subscribers_observe_lag_instead_of_stalling() {
        let hub = RoomHub::new(2);
        let mut rx = hub.subscribe("room_a").await;
        for version in 1..=5 {
            hub.publish("room_a", message(version)).await;
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 1),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_drops_abandoned_channels() {
        let hub = RoomHub::new(4);
        {
            let _rx = hub.subscribe("room_a").await;
            assert_eq!(hub.subscriber_count("room_a").await, 1);
        }
        hub.cleanup().await;
        assert_eq!(hub.subscriber_count("room_a").await, 0);
    }
}
