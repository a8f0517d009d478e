mod view;

pub use view::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use nudge_schema::{ChatMessage, ChatRole, RecordMeta, StateEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Smallest queue a subscription gets; the on-connect snapshot alone needs two slots.
pub const MIN_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Deliver events for users without subscribers to every subscriber instead of
    /// dropping them. Leaks events across users; kept for older front-ends only.
    #[serde(default)]
    pub fallback_to_all: bool,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            fallback_to_all: false,
        }
    }
}

/// Supplies the state a new subscriber sees before any live event.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<Value>;
    async fn schedule(&self, user_id: &str) -> Result<Option<Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(String),
    All,
}

impl Target {
    pub fn user(user_id: impl Into<String>) -> Self {
        Target::User(user_id.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("broadcast hub is closed")]
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub users: usize,
    pub delivered: u64,
    pub dropped_unrouted: u64,
    pub dropped_full: u64,
}

/// Anything that can be written as one server-sent event.
pub trait WireEvent {
    fn name(&self) -> &str;
    fn data(&self) -> Value;

    fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }
}

impl WireEvent for StateEvent {
    fn name(&self) -> &str {
        StateEvent::name(self)
    }

    fn data(&self) -> Value {
        StateEvent::data(self)
    }
}

#[derive(Debug)]
enum HubMessage {
    Event(StateEvent),
    Close,
}

struct Registration {
    id: u64,
    tx: mpsc::Sender<HubMessage>,
}

#[derive(Default)]
struct Registry {
    users: HashMap<String, Vec<Registration>>,
    closed: bool,
}

struct HubInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    config: HubConfig,
    snapshot: Arc<dyn SnapshotSource>,
    delivered: AtomicU64,
    dropped_unrouted: AtomicU64,
    dropped_full: AtomicU64,
}

impl HubInner {
    fn remove(&self, user_id: &str, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(list) = registry.users.get_mut(user_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|reg| reg.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.users.remove(user_id);
        }
        if removed {
            tracing::debug!(user_id, subscription = id, "subscription removed");
        }
        removed
    }
}

/// Per-user fan-out of state events to live subscribers.
///
/// Every subscription owns a bounded queue. Publishing never blocks: a full queue loses
/// that one event and the loss is counted in [`HubStats::dropped_full`].
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, snapshot: Arc<dyn SnapshotSource>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                config,
                snapshot,
                delivered: AtomicU64::new(0),
                dropped_unrouted: AtomicU64::new(0),
                dropped_full: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a subscriber whose first two events are the user's profile and schedule.
    pub async fn subscribe(&self, user_id: &str) -> Result<Subscription, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let snapshot = self.load_snapshot(user_id).await;
        self.register(user_id, snapshot)
    }

    /// Registers a subscriber that only sees live events.
    pub fn attach(&self, user_id: &str) -> Result<Subscription, HubError> {
        self.register(user_id, Vec::new())
    }

    fn register(&self, user_id: &str, initial: Vec<StateEvent>) -> Result<Subscription, HubError> {
        let capacity = self
            .inner
            .config
            .queue_capacity
            .max(MIN_QUEUE_CAPACITY)
            .max(initial.len());
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.inner.registry.lock();
        if registry.closed {
            return Err(HubError::Closed);
        }
        // Pushed under the lock so no live event can overtake the snapshot.
        for event in initial {
            let _ = tx.try_send(HubMessage::Event(event));
        }
        registry
            .users
            .entry(user_id.to_string())
            .or_default()
            .push(Registration { id, tx });
        drop(registry);

        tracing::debug!(user_id, subscription = id, "subscription registered");
        Ok(Subscription {
            user_id: user_id.to_string(),
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
            finished: false,
        })
    }

    async fn load_snapshot(&self, user_id: &str) -> Vec<StateEvent> {
        let profile = match self.inner.snapshot.profile(user_id).await {
            Ok(profile) => StateEvent::ProfileUpdate {
                user_id: user_id.to_string(),
                profile,
            },
            Err(error) => {
                tracing::warn!(user_id, %error, "profile snapshot unavailable");
                StateEvent::StateError {
                    message: format!("profile unavailable: {error}"),
                }
            }
        };
        let schedule = match self.inner.snapshot.schedule(user_id).await {
            Ok(schedule) => StateEvent::ScheduleUpdate {
                user_id: user_id.to_string(),
                schedule,
            },
            Err(error) => {
                tracing::warn!(user_id, %error, "schedule snapshot unavailable");
                StateEvent::StateError {
                    message: format!("schedule unavailable: {error}"),
                }
            }
        };
        vec![profile, schedule]
    }

    /// Pushes `event` to the targeted queues and returns how many accepted it.
    pub fn publish(&self, event: StateEvent, target: Target) -> usize {
        let registry = self.inner.registry.lock();
        if registry.closed {
            return 0;
        }

        let routed = match &target {
            Target::All => None,
            Target::User(user_id) => registry.users.get(user_id).filter(|list| !list.is_empty()),
        };
        let recipients: Vec<&Registration> = match (routed, &target) {
            (Some(list), _) => list.iter().collect(),
            (None, Target::All) => registry.users.values().flatten().collect(),
            (None, Target::User(user_id)) if self.inner.config.fallback_to_all => {
                tracing::warn!(
                    user_id = %user_id,
                    event = event.name(),
                    "no subscriber for user, falling back to all subscribers"
                );
                registry.users.values().flatten().collect()
            }
            (None, Target::User(user_id)) => {
                self.inner.dropped_unrouted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(user_id = %user_id, event = event.name(), "no subscriber, event dropped");
                return 0;
            }
        };

        if recipients.is_empty() {
            self.inner.dropped_unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let mut delivered = 0;
        for registration in recipients {
            match registration.tx.try_send(HubMessage::Event(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped_full.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = registration.id,
                        event = event.name(),
                        "subscriber queue full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn broadcast_chat(
        &self,
        user_id: &str,
        role: ChatRole,
        text: &str,
        meta: RecordMeta,
    ) -> usize {
        self.publish(
            StateEvent::ChatMessage(ChatMessage {
                user_id: user_id.to_string(),
                role,
                text: text.to_string(),
                meta,
            }),
            Target::user(user_id),
        )
    }

    pub async fn broadcast_profile(&self, user_id: &str) -> usize {
        let event = match self.inner.snapshot.profile(user_id).await {
            Ok(profile) => StateEvent::ProfileUpdate {
                user_id: user_id.to_string(),
                profile,
            },
            Err(error) => {
                tracing::warn!(user_id, %error, "failed to load profile for broadcast");
                StateEvent::StateError {
                    message: format!("profile unavailable: {error}"),
                }
            }
        };
        self.publish(event, Target::user(user_id))
    }

    pub async fn broadcast_schedule(&self, user_id: &str) -> usize {
        let event = match self.inner.snapshot.schedule(user_id).await {
            Ok(schedule) => StateEvent::ScheduleUpdate {
                user_id: user_id.to_string(),
                schedule,
            },
            Err(error) => {
                tracing::warn!(user_id, %error, "failed to load schedule for broadcast");
                StateEvent::StateError {
                    message: format!("schedule unavailable: {error}"),
                }
            }
        };
        self.publish(event, Target::user(user_id))
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.inner
            .registry
            .lock()
            .users
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.inner.registry.lock();
        HubStats {
            subscribers: registry.users.values().map(Vec::len).sum(),
            users: registry.users.len(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped_unrouted: self.inner.dropped_unrouted.load(Ordering::Relaxed),
            dropped_full: self.inner.dropped_full.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registry.lock().closed
    }

    /// Drops every registration and wakes each pending subscriber with a closing sentinel.
    pub fn close(&self) {
        let drained = {
            let mut registry = self.inner.registry.lock();
            registry.closed = true;
            std::mem::take(&mut registry.users)
        };
        let mut closed = 0;
        for registration in drained.into_values().flatten() {
            let _ = registration.tx.try_send(HubMessage::Close);
            closed += 1;
        }
        tracing::info!(subscriptions = closed, "broadcast hub closed");
    }
}

/// One connection's view of the hub. Dropping it unregisters the queue.
pub struct Subscription {
    user_id: String,
    id: u64,
    rx: mpsc::Receiver<HubMessage>,
    hub: Weak<HubInner>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event, or `None` once the hub closed or the subscription was removed and drained.
    pub async fn recv(&mut self) -> Option<StateEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(HubMessage::Event(event)) => Some(event),
            Some(HubMessage::Close) | None => {
                self.finished = true;
                self.unsubscribe();
                None
            }
        }
    }

    /// Removes the registration. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(&self.user_id, self.id);
        }
        self.hub = Weak::new();
    }

    pub fn into_stream(self) -> impl Stream<Item = StateEvent> + Send {
        async_stream::stream! {
            let mut subscription = self;
            while let Some(event) = subscription.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    struct StaticSnapshot {
        schedule: Option<Value>,
    }

    #[async_trait]
    impl SnapshotSource for StaticSnapshot {
        async fn profile(&self, user_id: &str) -> Result<Value> {
            Ok(json!({"basic": {"user_id": user_id}}))
        }

        async fn schedule(&self, _user_id: &str) -> Result<Option<Value>> {
            Ok(self.schedule.clone())
        }
    }

    struct BrokenProfile;

    #[async_trait]
    impl SnapshotSource for BrokenProfile {
        async fn profile(&self, _user_id: &str) -> Result<Value> {
            Err(anyhow!("profile.json is corrupt"))
        }

        async fn schedule(&self, _user_id: &str) -> Result<Option<Value>> {
            Ok(Some(json!({"timezone": "UTC"})))
        }
    }

    fn hub_with(config: HubConfig) -> BroadcastHub {
        BroadcastHub::new(config, Arc::new(StaticSnapshot { schedule: None }))
    }

    fn chat(user_id: &str, text: &str) -> StateEvent {
        StateEvent::ChatMessage(ChatMessage {
            user_id: user_id.into(),
            role: ChatRole::Assistant,
            text: text.into(),
            meta: RecordMeta::default(),
        })
    }

    async fn next(sub: &mut Subscription) -> StateEvent {
        timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_arrives_before_live_events() {
        let hub = hub_with(HubConfig::default());
        let mut sub = hub.subscribe("u1").await.unwrap();
        hub.publish(chat("u1", "live"), Target::user("u1"));

        assert_eq!(next(&mut sub).await.name(), "profile_update");
        let schedule = next(&mut sub).await;
        assert_eq!(
            schedule,
            StateEvent::ScheduleUpdate {
                user_id: "u1".into(),
                schedule: None
            }
        );
        assert_eq!(next(&mut sub).await, chat("u1", "live"));
    }

    #[tokio::test]
    async fn failed_snapshot_item_becomes_state_error() {
        let hub = BroadcastHub::new(HubConfig::default(), Arc::new(BrokenProfile));
        let mut sub = hub.subscribe("u1").await.unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.name(), "state_error");
        assert!(first.data()["message"]
            .as_str()
            .unwrap()
            .contains("corrupt"));
        assert_eq!(next(&mut sub).await.name(), "schedule_update");
    }

    #[tokio::test]
    async fn publish_targets_only_that_user() {
        let hub = hub_with(HubConfig::default());
        let mut alice = hub.attach("alice").unwrap();
        let mut bob = hub.attach("bob").unwrap();

        assert_eq!(hub.publish(chat("alice", "hi"), Target::user("alice")), 1);

        assert_eq!(next(&mut alice).await, chat("alice", "hi"));
        assert!(timeout(Duration::from_millis(50), bob.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unrouted_event_is_dropped_and_counted() {
        let hub = hub_with(HubConfig::default());
        let mut bob = hub.attach("bob").unwrap();

        assert_eq!(hub.publish(chat("alice", "hi"), Target::user("alice")), 0);

        assert!(timeout(Duration::from_millis(50), bob.recv()).await.is_err());
        assert_eq!(hub.stats().dropped_unrouted, 1);
    }

    #[tokio::test]
    async fn compatibility_flag_falls_back_to_everyone() {
        let hub = hub_with(HubConfig {
            fallback_to_all: true,
            ..HubConfig::default()
        });
        let mut bob = hub.attach("bob").unwrap();

        assert_eq!(hub.publish(chat("alice", "hi"), Target::user("alice")), 1);
        assert_eq!(next(&mut bob).await, chat("alice", "hi"));
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_user() {
        let hub = hub_with(HubConfig::default());
        let mut a = hub.attach("a").unwrap();
        let mut b = hub.attach("b").unwrap();

        let event = StateEvent::StateError {
            message: "maintenance".into(),
        };
        assert_eq!(hub.publish(event.clone(), Target::All), 2);
        assert_eq!(next(&mut a).await, event);
        assert_eq!(next(&mut b).await, event);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_isolated() {
        let hub = hub_with(HubConfig::default());
        let mut first = hub.subscribe("u1").await.unwrap();
        let mut second = hub.attach("u1").unwrap();
        assert_eq!(hub.subscriber_count("u1"), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(hub.subscriber_count("u1"), 1);

        hub.publish(chat("u1", "still here"), Target::user("u1"));
        assert_eq!(next(&mut second).await, chat("u1", "still here"));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_leaves_no_registration() {
        let hub = hub_with(HubConfig::default());
        let sub = hub.subscribe("u1").await.unwrap();
        drop(sub);

        assert_eq!(hub.subscriber_count("u1"), 0);
        assert_eq!(hub.stats().users, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_newest_event() {
        let hub = hub_with(HubConfig {
            queue_capacity: 1,
            ..HubConfig::default()
        });
        let mut sub = hub.attach("u1").unwrap();

        for i in 0..(MIN_QUEUE_CAPACITY + 2) {
            hub.publish(chat("u1", &format!("m{i}")), Target::user("u1"));
        }

        assert_eq!(hub.stats().dropped_full, 2);
        assert_eq!(next(&mut sub).await, chat("u1", "m0"));
    }

    #[tokio::test]
    async fn close_unblocks_pending_subscribers() {
        let hub = hub_with(HubConfig::default());
        let mut sub = hub.attach("u1").unwrap();

        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        hub.close();

        let received = timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
        assert_eq!(hub.stats().subscribers, 0);
        assert!(matches!(hub.subscribe("u1").await, Err(HubError::Closed)));
    }

    #[tokio::test]
    async fn broadcast_profile_publishes_fresh_snapshot() {
        let hub = hub_with(HubConfig::default());
        let mut sub = hub.attach("u1").unwrap();

        assert_eq!(hub.broadcast_profile("u1").await, 1);
        let event = next(&mut sub).await;
        assert_eq!(event.name(), "profile_update");
        assert_eq!(event.data()["profile"]["basic"]["user_id"], "u1");
    }

    #[test]
    fn sse_frame_layout() {
        let event = StateEvent::StateError {
            message: "boom".into(),
        };
        assert_eq!(
            event.to_sse_frame(),
            "event: state_error\ndata: {\"message\":\"boom\"}\n\n"
        );
    }
}
