//! Per-path progress broadcast.
//!
//! Each subscriber owns a bounded queue. `publish` never waits: it offers the
//! event to every queue registered for the path with `try_send`, and a
//! subscriber whose queue is full is evicted (its stream ends) instead of
//! stalling the session. Events reach each subscriber in publication order.
//! There is no replay; a subscriber only sees what is published after it
//! registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use stencil_core::{ProgressEvent, SourceKey};

/// Opaque handle naming one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Slot {
    id: SubscriptionId,
    tx: mpsc::Sender<ProgressEvent>,
}

struct ChannelInner {
    capacity: usize,
    next_id: AtomicU64,
    slots: Mutex<HashMap<SourceKey, Vec<Slot>>>,
}

impl ChannelInner {
    fn remove(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.lock();
        let mut removed = false;
        slots.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|slot| slot.id != id);
            removed |= subscribers.len() != before;
            !subscribers.is_empty()
        });
        removed
    }
}

/// Broadcast registry shared by the orchestrator and the transport host.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

impl ProgressChannel {
    /// `capacity` is the per-subscriber queue depth and must be non-zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to events for a raw, caller-supplied path.
    pub fn subscribe(&self, path: &str) -> Subscription {
        self.subscribe_key(SourceKey::from_raw(path))
    }

    pub fn subscribe_key(&self, key: SourceKey) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner
            .slots
            .lock()
            .entry(key.clone())
            .or_default()
            .push(Slot { id, tx });
        tracing::debug!(subscription = %id, source = %key, "subscribed");
        Subscription {
            id,
            key,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Register a callback invoked once per event, in order, on a tokio task.
    ///
    /// Must be called from within a tokio runtime. The callback stops after
    /// [`unsubscribe`](Self::unsubscribe) once queued events are drained.
    pub fn subscribe_with<F>(&self, path: &str, mut callback: F) -> SubscriptionId
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(path);
        let id = subscription.id();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        id
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            tracing::debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Offer `event` to every subscriber of `key`; returns how many queued it.
    ///
    /// Never blocks on a subscriber. Closed subscribers are pruned and full
    /// ones evicted.
    pub fn publish(&self, key: &SourceKey, event: ProgressEvent) -> usize {
        let mut slots = self.inner.slots.lock();
        let Some(subscribers) = slots.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0usize;
        subscribers.retain(|slot| match slot.tx.try_send(event) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscription = %slot.id,
                    source = %key,
                    "subscriber queue full; dropping subscriber",
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            slots.remove(key);
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &SourceKey) -> usize {
        self.inner
            .slots
            .lock()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("capacity", &self.inner.capacity)
            .field("paths", &self.inner.slots.lock().len())
            .finish()
    }
}

/// Ordered stream of events for one path. Unregisters on drop.
pub struct Subscription {
    id: SubscriptionId,
    key: SourceKey,
    rx: mpsc::Receiver<ProgressEvent>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// Next event, or `None` once unsubscribed/evicted and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stencil_core::SyncStatus;

    fn key(raw: &str) -> SourceKey {
        SourceKey(raw.to_string())
    }

    fn ev(status: SyncStatus, progress: u8) -> ProgressEvent {
        ProgressEvent::new(status, progress)
    }

    #[tokio::test]
    async fn every_subscriber_sees_events_in_order() {
        let channel = ProgressChannel::new(16);
        let mut a = channel.subscribe_key(key("/t"));
        let mut b = channel.subscribe_key(key("/t"));

        assert_eq!(channel.publish(&key("/t"), ev(SyncStatus::Scanning, 0)), 2);
        assert_eq!(channel.publish(&key("/t"), ev(SyncStatus::Updated, 100)), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await, Some(ev(SyncStatus::Scanning, 0)));
            assert_eq!(sub.recv().await, Some(ev(SyncStatus::Updated, 100)));
        }
    }

    #[tokio::test]
    async fn events_are_scoped_to_their_path() {
        let channel = ProgressChannel::new(4);
        let mut other = channel.subscribe_key(key("/other"));
        assert_eq!(channel.publish(&key("/t"), ev(SyncStatus::Scanning, 0)), 0);
        assert_eq!(other.try_recv(), None);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let channel = ProgressChannel::new(4);
        let _early = channel.subscribe_key(key("/t"));
        channel.publish(&key("/t"), ev(SyncStatus::Scanning, 0));

        let mut late = channel.subscribe_key(key("/t"));
        assert_eq!(late.try_recv(), None);
        channel.publish(&key("/t"), ev(SyncStatus::UpdateNotRequired, 100));
        assert_eq!(late.recv().await, Some(ev(SyncStatus::UpdateNotRequired, 100)));
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted_without_affecting_others() {
        let channel = ProgressChannel::new(2);
        let mut slow = channel.subscribe_key(key("/t"));
        let mut fast = channel.subscribe_key(key("/t"));

        for p in [0u8, 10, 20] {
            channel.publish(&key("/t"), ev(SyncStatus::Updating, p));
            // fast keeps up.
            assert_eq!(fast.recv().await, Some(ev(SyncStatus::Updating, p)));
        }
        assert_eq!(channel.subscriber_count(&key("/t")), 1);

        assert_eq!(slow.recv().await, Some(ev(SyncStatus::Updating, 0)));
        assert_eq!(slow.recv().await, Some(ev(SyncStatus::Updating, 10)));
        assert_eq!(slow.recv().await, None, "evicted stream ends");
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_unregister() {
        let channel = ProgressChannel::new(4);
        let a = channel.subscribe_key(key("/t"));
        let mut b = channel.subscribe_key(key("/t"));

        assert!(channel.unsubscribe(a.id()));
        assert!(!channel.unsubscribe(a.id()));
        assert_eq!(channel.publish(&key("/t"), ev(SyncStatus::Scanning, 0)), 1);
        assert_eq!(b.recv().await, Some(ev(SyncStatus::Scanning, 0)));

        drop(b);
        drop(a);
        assert_eq!(channel.subscriber_count(&key("/t")), 0);
        assert_eq!(channel.publish(&key("/t"), ev(SyncStatus::Scanning, 0)), 0);
    }

    #[tokio::test]
    async fn callback_subscription_receives_events() {
        let channel = ProgressChannel::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().display().to_string();

        let id = channel.subscribe_with(&path, move |event| {
            let _ = tx.send(event);
        });
        let key = SourceKey::from_raw(&path);
        channel.publish(&key, ev(SyncStatus::Scanning, 0));
        channel.publish(&key, ev(SyncStatus::UpdateNotRequired, 100));

        assert_eq!(rx.recv().await, Some(ev(SyncStatus::Scanning, 0)));
        assert_eq!(rx.recv().await, Some(ev(SyncStatus::UpdateNotRequired, 100)));
        assert!(channel.unsubscribe(id));
        assert_eq!(rx.recv().await, None, "callback task ends after unsubscribe");
    }
}
