//! Multi-channel publish/subscribe hub for pipeline observers.
//!
//! Channels are named strings. Every subscriber owns a bounded queue with
//! drop-oldest overflow, so a slow subscriber can never backpressure into a
//! publisher. A background heartbeat enqueues liveness pings; subscriptions
//! acknowledge by draining them, and subscriptions that stop draining are
//! closed and removed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default per-subscription queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Interval between heartbeat pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long a subscription may sit on an unacknowledged ping before it is
/// considered stale and evicted.
pub const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Error type for hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("failed to encode event payload: {0}")]
    Encode(String),
}

enum QueueItem {
    Event(Value),
    Ping(u64),
}

struct SubscriberShared {
    capacity: usize,
    channel: String,
    closed: AtomicBool,
    /// Heartbeat sequence current when the subscription was created; pings
    /// from earlier rounds are not held against it.
    created_seq: u64,
    id: u64,
    last_pong: AtomicU64,
    notify: Notify,
    queue: Mutex<VecDeque<QueueItem>>,
}

impl SubscriberShared {
    fn push(&self, item: QueueItem) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        if let Ok(mut queue) = self.queue.lock() {
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// One live subscription to a hub channel.
///
/// Dropping the subscription closes it; the hub prunes it on the next
/// publish or heartbeat round.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Receives the next event payload, acknowledging heartbeat pings along
    /// the way.
    ///
    /// # Errors
    /// Returns [`HubError::SubscriptionClosed`] once the subscription is
    /// closed and its queue is drained.
    pub async fn recv(&mut self) -> Result<Value, HubError> {
        loop {
            let notified = self.shared.notify.notified();
            let item = self
                .shared
                .queue
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front());

            match item {
                Some(QueueItem::Event(value)) => return Ok(value),
                Some(QueueItem::Ping(seq)) => {
                    self.shared.last_pong.fetch_max(seq, Ordering::AcqRel);
                }
                None => {
                    if self.shared.closed.load(Ordering::Acquire) {
                        return Err(HubError::SubscriptionClosed);
                    }
                    notified.await;
                }
            }
        }
    }

    /// Closes the subscription explicitly.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns the channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct HubInner {
    capacity: usize,
    channels: Mutex<HashMap<String, Vec<Arc<SubscriberShared>>>>,
    next_subscriber_id: AtomicU64,
    ping_seq: AtomicU64,
}

/// Process-wide publish/subscribe hub. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Creates a hub with the default per-subscription queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a hub with an explicit per-subscription queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                channels: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                ping_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to a channel.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            capacity: self.inner.capacity,
            channel: channel.to_string(),
            closed: AtomicBool::new(false),
            created_seq: self.inner.ping_seq.load(Ordering::Acquire),
            id: self.inner.next_subscriber_id.fetch_add(1, Ordering::AcqRel),
            last_pong: AtomicU64::new(0),
            notify: Notify::new(),
            queue: Mutex::new(VecDeque::new()),
        });

        if let Ok(mut channels) = self.inner.channels.lock() {
            channels
                .entry(channel.to_string())
                .or_default()
                .push(Arc::clone(&shared));
        }

        Subscription { shared }
    }

    /// Publishes a raw payload on a channel.
    ///
    /// Never blocks: slow subscribers lose their oldest queued entries.
    pub fn publish(&self, channel: &str, payload: Value) {
        let subscribers = self.live_subscribers(channel);
        debug!(channel, receivers = subscribers.len(), "event published");

        for subscriber in subscribers {
            subscriber.push(QueueItem::Event(payload.clone()));
        }
    }

    /// Serializes and publishes a typed event on a channel.
    ///
    /// # Errors
    /// Returns an error when the event cannot be encoded as JSON.
    pub fn publish_event<T: Serialize>(&self, channel: &str, event: &T) -> Result<(), HubError> {
        let payload =
            serde_json::to_value(event).map_err(|error| HubError::Encode(error.to_string()))?;
        self.publish(channel, payload);

        Ok(())
    }

    /// Returns the number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.live_subscribers(channel).len()
    }

    /// Spawns the heartbeat task with production intervals.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        self.spawn_heartbeat_with(HEARTBEAT_INTERVAL, PONG_DEADLINE)
    }

    /// Spawns the heartbeat task with explicit intervals (test hook).
    ///
    /// Each round enqueues one ping on every live subscription, waits for
    /// the pong deadline, and evicts subscriptions that did not drain it.
    pub fn spawn_heartbeat_with(&self, interval: Duration, deadline: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let seq = inner.ping_seq.fetch_add(1, Ordering::AcqRel) + 1;
                let probed: Vec<Arc<SubscriberShared>> = {
                    let Ok(channels) = inner.channels.lock() else {
                        return;
                    };
                    channels
                        .values()
                        .flatten()
                        .filter(|subscriber| !subscriber.closed.load(Ordering::Acquire))
                        .filter(|subscriber| subscriber.created_seq < seq)
                        .map(Arc::clone)
                        .collect()
                };

                for subscriber in &probed {
                    subscriber.push(QueueItem::Ping(seq));
                }

                tokio::time::sleep(deadline).await;

                let mut evicted = 0usize;
                for subscriber in &probed {
                    if subscriber.last_pong.load(Ordering::Acquire) < seq {
                        subscriber.close();
                        evicted += 1;
                        warn!(
                            channel = subscriber.channel.as_str(),
                            subscriber = subscriber.id,
                            "evicting stale subscription"
                        );
                    }
                }

                if evicted > 0
                    && let Ok(mut channels) = inner.channels.lock()
                {
                    for subscribers in channels.values_mut() {
                        subscribers
                            .retain(|subscriber| !subscriber.closed.load(Ordering::Acquire));
                    }
                }
            }
        })
    }

    fn live_subscribers(&self, channel: &str) -> Vec<Arc<SubscriberShared>> {
        let Ok(mut channels) = self.inner.channels.lock() else {
            return Vec::new();
        };

        let Some(subscribers) = channels.get_mut(channel) else {
            return Vec::new();
        };
        subscribers.retain(|subscriber| !subscriber.closed.load(Ordering::Acquire));

        subscribers.iter().map(Arc::clone).collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::domain::event::{CHANNEL_GM, GmEvent};
    use crate::domain::project::Phase;

    #[tokio::test]
    async fn test_publish_subscribe_round_trip() {
        // Arrange
        let hub = EventHub::new();
        let mut subscription = hub.subscribe(CHANNEL_GM);
        let event = GmEvent::PhaseChange {
            project_id: "p1".to_string(),
            phase: Phase::Waiting,
        };

        // Act
        hub.publish_event(CHANNEL_GM, &event)
            .expect("failed to publish");
        let received = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("recv timed out")
            .expect("recv failed");

        // Assert
        assert_eq!(received["type"], "phase_change");
        assert_eq!(received["phase"], "waiting");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive_the_event() {
        // Arrange
        let hub = EventHub::new();
        let mut first = hub.subscribe("teams");
        let mut second = hub.subscribe("teams");

        // Act
        hub.publish("teams", json!({"type": "team_progress"}));

        // Assert
        for subscription in [&mut first, &mut second] {
            let received = timeout(Duration::from_secs(1), subscription.recv())
                .await
                .expect("recv timed out")
                .expect("recv failed");
            assert_eq!(received["type"], "team_progress");
        }
        assert_eq!(hub.subscriber_count("teams"), 2);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        // Arrange
        let hub = EventHub::new();
        let mut logs = hub.subscribe("logs");

        // Act
        hub.publish("gm", json!({"n": 1}));
        hub.publish("logs", json!({"n": 2}));

        // Assert
        let received = timeout(Duration::from_secs(1), logs.recv())
            .await
            .expect("recv timed out")
            .expect("recv failed");
        assert_eq!(received["n"], 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_entries() {
        // Arrange
        let hub = EventHub::with_capacity(2);
        let mut subscription = hub.subscribe("gm");

        // Act
        for n in 0..5 {
            hub.publish("gm", json!({"n": n}));
        }
        let first = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("recv timed out")
            .expect("recv failed");
        let second = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("recv timed out")
            .expect("recv failed");

        // Assert: only the newest two survive.
        assert_eq!(first["n"], 3);
        assert_eq!(second["n"], 4);
    }

    #[tokio::test]
    async fn test_recv_after_close_reports_closed() {
        // Arrange
        let hub = EventHub::new();
        let mut subscription = hub.subscribe("gm");
        hub.publish("gm", json!({"n": 1}));

        // Act
        subscription.close();
        let drained = subscription.recv().await;
        let closed = subscription.recv().await;

        // Assert: queued events drain before the closed error surfaces.
        assert!(drained.is_ok());
        assert!(matches!(closed, Err(HubError::SubscriptionClosed)));
    }

    #[tokio::test]
    async fn test_dropping_subscription_removes_it_from_the_channel() {
        // Arrange
        let hub = EventHub::new();
        let subscription = hub.subscribe("gm");
        assert_eq!(hub.subscriber_count("gm"), 1);

        // Act
        drop(subscription);

        // Assert
        assert_eq!(hub.subscriber_count("gm"), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_stale_subscriber_and_keeps_draining_one() {
        // Arrange
        let hub = EventHub::new();
        let stale = hub.subscribe("gm");
        let mut draining = hub.subscribe("gm");
        let drain_task = tokio::spawn(async move {
            // Drain until the hub closes us; pings are acknowledged inside
            // recv.
            while draining.recv().await.is_ok() {}
        });
        let heartbeat =
            hub.spawn_heartbeat_with(Duration::from_millis(25), Duration::from_millis(50));

        // Act: never drain `stale`, let several heartbeat rounds pass.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let live = hub.subscriber_count("gm");

        // Assert
        assert_eq!(live, 1);
        heartbeat.abort();
        drop(stale);
        drop(hub);
        drain_task.abort();
    }
}
