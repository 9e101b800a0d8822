// =============================================================================
// Cross-worker Event Channel
// =============================================================================
//
// Named fan-out pub/sub over a single tokio broadcast channel. Delivery is
// advisory and at-least-once-ish: publishing never blocks or fails ingestion,
// and slow subscribers may miss messages (they fall back to their cycle
// timeout). Payloads carry no authority — subscribers re-read the store.
// =============================================================================

use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::debug;

/// Channel name published whenever new feed records land in the store.
pub const NEW_FEED_DATA: &str = "new_feed_data";
/// Channel name published after a score cycle commits.
pub const SCORE_COMPLETE: &str = "score_complete";

/// One published event: `(channel, payload)`.
#[derive(Debug, Clone)]
pub struct Event {
    pub channel: String,
    pub payload: String,
}

/// Process-wide event bus shared by all workers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Best-effort publish. A send error only means there are currently no
    /// subscribers, which is fine.
    pub fn publish(&self, channel: &str, payload: &str) {
        let event = Event {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        if self.tx.send(event).is_err() {
            debug!(channel, "event published with no subscribers");
        }
    }

    /// Subscribe to the raw event stream (all channels).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Wait until an event arrives on `channel` or `timeout` elapses.
    /// Returns `true` when notified, `false` on timeout. Lagged receivers are
    /// treated as notified — something definitely happened.
    pub async fn wait_for(&self, channel: &str, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.channel == channel {
                        return true;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => return true,
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_) => return false,
            }
        }
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
    async fn wait_for_sees_matching_channel() {
        let bus = EventBus::new(8);
        let waiter = {
            let rx_bus = bus.tx.clone();
            tokio::spawn(async move {
                let bus = EventBus { tx: rx_bus };
                bus.wait_for(NEW_FEED_DATA, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(NEW_FEED_DATA, "");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_ignores_other_channels_until_timeout() {
        let bus = EventBus::new(8);
        let tx = bus.tx.clone();
        let waiter = tokio::spawn(async move {
            let bus = EventBus { tx };
            bus.wait_for(SCORE_COMPLETE, Duration::from_millis(100)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(NEW_FEED_DATA, "");
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.publish(NEW_FEED_DATA, "payload");
    }
}
