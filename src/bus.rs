//! In-process broadcast of progress, approval, and completion events.
//!
//! One producer-agnostic channel: the gate, sessions, pool, queue, and
//! control plane all publish; every streaming subscriber receives every
//! update and filters by user itself. Delivery is best-effort — a subscriber
//! that falls more than [`crate::constants::UPDATE_BUS_CAPACITY`] updates
//! behind observes a lag and skips; nothing is persisted or replayed.

use crate::{constants::UPDATE_BUS_CAPACITY, models::Update};
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct UpdateBus {
    sender: broadcast::Sender<Update>,
}

impl UpdateBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(UPDATE_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an update to all current subscribers. Publishing with no
    /// subscribers is not an error; the update is simply dropped.
    pub fn publish(&self, update: Update) {
        let _ = self.sender.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = UpdateBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Update::status("u1", "hello"));

        assert_eq!(rx1.recv().await.unwrap().user_id(), "u1");
        assert_eq!(rx2.recv().await.unwrap().user_id(), "u1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = UpdateBus::new();
        bus.publish(Update::status("u1", "nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_breaking_others() {
        let bus = UpdateBus::new();
        let mut slow = bus.subscribe();

        for i in 0..(UPDATE_BUS_CAPACITY + 10) {
            bus.publish(Update::status("u1", format!("update {i}")));
        }

        // The slow subscriber sees a lag, then resumes from the window.
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 10),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(slow.recv().await.is_ok());
    }
}
