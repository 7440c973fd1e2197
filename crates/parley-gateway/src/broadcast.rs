//! Group broadcast: one channel per group, N independent subscribers
//!
//! A channel is created by the first subscriber of a group and torn down
//! once it has had no subscribers for a grace period. Publishing never
//! creates a channel. Each subscriber owns an unbounded queue and only sees
//! messages published after it subscribed.

use dashmap::DashMap;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Broadcast settings
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long an empty channel survives before teardown
    pub grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(15),
        }
    }
}

struct ChannelState {
    subscribers: usize,
    closed: bool,
    idle_timer: Option<AbortHandle>,
    /// Bumped whenever the timer is armed or cancelled
    generation: u64,
}

/// Per-group multiplexer
pub struct BroadcastChannel<T> {
    group: String,
    state: Mutex<ChannelState>,
    senders: Mutex<HashMap<u64, mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> BroadcastChannel<T> {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            state: Mutex::new(ChannelState {
                subscribers: 0,
                closed: false,
                idle_timer: None,
                generation: 0,
            }),
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers
    }

    // Lock order: state before senders.
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_senders(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<T>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a subscriber; `None` once the channel has been torn down
    fn attach(&self, id: u64) -> Option<mpsc::UnboundedReceiver<T>> {
        let mut state = self.lock_state();
        if state.closed {
            return None;
        }
        state.subscribers += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
            state.generation += 1;
            debug!(group = %self.group, "Idle teardown cancelled by new subscriber");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_senders().insert(id, tx);
        Some(rx)
    }

    /// Remove a subscriber, arming the idle timer when the last one leaves
    fn detach(self: &Arc<Self>, id: u64, registry: Weak<RegistryInner<T>>, grace: Duration) -> bool {
        let mut state = self.lock_state();
        if self.lock_senders().remove(&id).is_none() {
            return false;
        }
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers > 0 || state.closed {
            return true;
        }

        state.generation += 1;
        let generation = state.generation;
        let channel = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let timer = runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let (Some(registry), Some(channel)) = (registry.upgrade(), channel.upgrade()) {
                        registry.expire(&channel, generation);
                    }
                });
                if let Some(previous) = state.idle_timer.replace(timer.abort_handle()) {
                    previous.abort();
                }
                debug!(group = %self.group, "Last subscriber left, teardown in {:?}", grace);
            }
            Err(_) => {
                drop(state);
                if let Some(registry) = registry.upgrade() {
                    registry.expire(self, generation);
                }
            }
        }
        true
    }

    /// Deliver to every current subscriber, returning how many received it
    fn publish(&self, message: T) -> usize {
        let senders = self.lock_senders();
        senders
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}

struct RegistryInner<T> {
    channels: DashMap<String, Arc<BroadcastChannel<T>>>,
    next_subscriber: AtomicU64,
    grace: Duration,
}

impl<T: Clone + Send + 'static> RegistryInner<T> {
    /// Tear a channel down if it is still idle under the same timer
    fn expire(&self, channel: &Arc<BroadcastChannel<T>>, generation: u64) {
        {
            let mut state = channel.lock_state();
            if state.closed || state.subscribers > 0 || state.generation != generation {
                return;
            }
            state.closed = true;
            state.idle_timer = None;
            channel.lock_senders().clear();
        }
        self.channels
            .remove_if(&channel.group, |_, current| Arc::ptr_eq(current, channel));
        info!(group = %channel.group, "Broadcast channel torn down");
    }
}

/// Owns one [`BroadcastChannel`] per group
pub struct BroadcastRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for BroadcastRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastRegistry<T> {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                channels: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
                grace: config.grace,
            }),
        }
    }

    /// Subscribe to future messages of `group`, creating its channel if needed
    pub fn subscribe(&self, group: &str) -> Subscription<T> {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        loop {
            let channel = self
                .inner
                .channels
                .entry(group.to_string())
                .or_insert_with(|| {
                    info!(group = %group, "Creating broadcast channel");
                    Arc::new(BroadcastChannel::new(group))
                })
                .clone();

            if let Some(rx) = channel.attach(id) {
                debug!(group = %group, subscriber = id, "Subscribed");
                return Subscription {
                    id,
                    rx,
                    channel,
                    registry: Arc::downgrade(&self.inner),
                };
            }

            // Lost a race with teardown; replace the dead channel
            self.inner
                .channels
                .remove_if(group, |_, current| Arc::ptr_eq(current, &channel));
        }
    }

    /// Remove subscriber `id` from `group`; false if it was not subscribed
    pub fn unsubscribe(&self, group: &str, id: u64) -> bool {
        let Some(channel) = self.inner.channels.get(group).map(|c| Arc::clone(&c)) else {
            return false;
        };
        channel.detach(id, Arc::downgrade(&self.inner), self.inner.grace)
    }

    /// Deliver to the group's current subscribers; no-op for unknown groups
    pub fn publish(&self, group: &str, message: T) -> usize {
        let Some(channel) = self.inner.channels.get(group).map(|c| Arc::clone(&c)) else {
            return 0;
        };
        channel.publish(message)
    }

    pub fn contains(&self, group: &str) -> bool {
        self.inner.channels.contains_key(group)
    }

    pub fn subscriber_count(&self, group: &str) -> usize {
        self.inner
            .channels
            .get(group)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    pub fn group_count(&self) -> usize {
        self.inner.channels.len()
    }
}

/// One subscriber's view of a group; unsubscribes when dropped
pub struct Subscription<T: Clone + Send + 'static> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    channel: Arc<BroadcastChannel<T>>,
    registry: Weak<RegistryInner<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the channel is torn down
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T: Clone + Send + 'static> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        let grace = self
            .registry
            .upgrade()
            .map(|r| r.grace)
            .unwrap_or(Duration::ZERO);
        if self.channel.detach(self.id, self.registry.clone(), grace) {
            debug!(group = %self.channel.group, subscriber = self.id, "Unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn registry(grace_ms: u64) -> BroadcastRegistry<String> {
        BroadcastRegistry::new(BroadcastConfig {
            grace: Duration::from_millis(grace_ms),
        })
    }

    #[tokio::test]
    async fn test_subscribers_see_publishes_in_order() {
        let registry = registry(1000);
        let mut a = registry.subscribe("room");
        let mut b = registry.subscribe("room");

        assert_eq!(registry.publish("room", "one".to_string()), 2);
        assert_eq!(registry.publish("room", "two".to_string()), 2);

        assert_eq!(a.recv().await.as_deref(), Some("one"));
        assert_eq!(a.recv().await.as_deref(), Some("two"));
        assert_eq!(b.next().await.as_deref(), Some("one"));
        assert_eq!(b.next().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_new_subscriber_gets_no_history() {
        let registry = registry(1000);
        let _first = registry.subscribe("room");
        registry.publish("room", "before".to_string());

        let mut late = registry.subscribe("room");
        registry.publish("room", "after".to_string());
        assert_eq!(late.recv().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_group_is_noop() {
        let registry = registry(1000);
        assert_eq!(registry.publish("nobody", "x".to_string()), 0);
        assert!(!registry.contains("nobody"));
    }

    #[tokio::test]
    async fn test_teardown_after_grace() {
        let registry = registry(20);
        let sub = registry.subscribe("room");
        drop(sub);

        assert!(registry.contains("room"));
        assert_eq!(registry.subscriber_count("room"), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!registry.contains("room"));
        assert_eq!(registry.publish("room", "lost".to_string()), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_during_grace_prevents_teardown() {
        let registry = registry(40);
        drop(registry.subscribe("room"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut again = registry.subscribe("room");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.contains("room"));
        assert_eq!(registry.publish("room", "still here".to_string()), 1);
        assert_eq!(again.recv().await.as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn test_rearmed_timer_uses_latest_departure() {
        let registry = registry(50);
        drop(registry.subscribe("room"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(registry.subscribe("room"));

        // First timer would have fired by now
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(registry.contains("room"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!registry.contains("room"));
    }

    #[tokio::test]
    async fn test_subscribe_after_teardown_creates_fresh_channel() {
        let registry = registry(10);
        drop(registry.subscribe("room"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.contains("room"));

        let mut sub = registry.subscribe("room");
        assert_eq!(registry.group_count(), 1);
        registry.publish("room", "fresh".to_string());
        assert_eq!(sub.recv().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_explicit_unsubscribe_by_id() {
        let registry = registry(1000);
        let sub = registry.subscribe("room");
        let _other = registry.subscribe("room");

        assert!(registry.unsubscribe("room", sub.id()));
        assert!(!registry.unsubscribe("room", sub.id()));
        assert_eq!(registry.subscriber_count("room"), 1);
        drop(sub);
        assert_eq!(registry.subscriber_count("room"), 1);
    }

    #[tokio::test]
    async fn test_teardown_closes_streams() {
        let registry = registry(10);
        let mut a = registry.subscribe("room");
        let id = a.id();
        registry.unsubscribe("room", id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.recv().await, None);
    }
}
