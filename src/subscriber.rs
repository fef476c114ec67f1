//! # Subscribers and the subscription registry
//!
//! A subscriber owns a set of formatted topics and exactly one delivery sink:
//! a handler or a bounded channel. The [`Registry`] keeps every live subscriber
//! so the broadcaster can find the ones interested in a notification.
//!
//! Locking rules: the per-subscriber state lock and the registry lock are
//! short, synchronous critical sections and are never held across an await.
//! LISTEN/UNLISTEN round trips are serialized per subscriber by a separate
//! async operation lock, so a pending registration never blocks delivery.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::config::SubscriberSettings;
use crate::contract::{Consumer, NotificationHandler};
use crate::error::{PubSubError, Result};
use crate::listener::CommandQueue;
use crate::topic::{format_topic, validate_channel};
use crate::types::{Notification, SubscriberId};

/// Delivery target of a subscriber
pub(crate) enum Sink {
    Handler(Arc<dyn NotificationHandler>),
    /// `sender` is taken out on close, which closes the receiving side
    Channel {
        sender: Option<mpsc::Sender<Notification>>,
        send_timeout: Duration,
    },
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Sink::Handler"),
            Self::Channel {
                sender,
                send_timeout,
            } => f
                .debug_struct("Sink::Channel")
                .field("open", &sender.is_some())
                .field("send_timeout", send_timeout)
                .finish(),
        }
    }
}

/// Snapshot of a sink taken for one delivery
pub(crate) enum Delivery {
    Handler(Arc<dyn NotificationHandler>),
    Channel {
        sender: mpsc::Sender<Notification>,
        send_timeout: Duration,
    },
}

#[derive(Debug)]
struct SubscriberState {
    topics: Vec<String>,
    sink: Sink,
    closed: bool,
}

/// Subscriber state shared between the caller's handle and the registry
#[derive(Debug)]
pub(crate) struct SubscriberShared {
    id: SubscriberId,
    app: String,
    namespace: String,
    state: RwLock<SubscriberState>,
}

impl SubscriberShared {
    pub(crate) fn new(id: SubscriberId, settings: &SubscriberSettings, sink: Sink) -> Self {
        Self {
            id,
            app: settings.app.clone(),
            namespace: settings.namespace.clone(),
            state: RwLock::new(SubscriberState {
                topics: Vec::new(),
                sink,
                closed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    /// Format a bare topic with this subscriber's app and namespace
    pub(crate) fn format(&self, topic: &str) -> String {
        format_topic(&self.app, &self.namespace, topic)
    }

    /// True iff open and subscribed to the formatted `topic`
    pub(crate) fn matches(&self, topic: &str) -> bool {
        let state = self.state.read();
        !state.closed && state.topics.iter().any(|t| t == topic)
    }

    pub(crate) fn delivery(&self) -> Option<Delivery> {
        let state = self.state.read();
        if state.closed {
            return None;
        }
        match &state.sink {
            Sink::Handler(handler) => Some(Delivery::Handler(Arc::clone(handler))),
            Sink::Channel {
                sender,
                send_timeout,
            } => sender.as_ref().map(|sender| Delivery::Channel {
                sender: sender.clone(),
                send_timeout: *send_timeout,
            }),
        }
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.state.read().topics.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    fn contains(&self, channel: &str) -> bool {
        self.state.read().topics.iter().any(|t| t == channel)
    }

    /// Record a listened channel; false if the subscriber closed meanwhile
    pub(crate) fn add_topic(&self, channel: String) -> bool {
        let mut state = self.state.write();
        if state.closed {
            return false;
        }
        if !state.topics.contains(&channel) {
            state.topics.push(channel);
        }
        true
    }

    fn remove_topic(&self, channel: &str) {
        self.state.write().topics.retain(|t| t != channel);
    }

    /// Mark closed, forget the topics and release the sink
    ///
    /// Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.write();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.topics.clear();
        if let Sink::Channel { sender, .. } = &mut state.sink {
            sender.take();
        }
        true
    }
}

/// Set of live subscribers
#[derive(Debug, Default)]
pub(crate) struct Registry {
    subscribers: RwLock<Vec<Arc<SubscriberShared>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a subscriber; false if one with the same id is present
    pub(crate) fn add(&self, subscriber: Arc<SubscriberShared>) -> bool {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.id() == subscriber.id()) {
            return false;
        }
        subscribers.push(subscriber);
        true
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        subscribers.len() != before
    }

    /// Snapshot of the subscribers interested in `topic`
    pub(crate) fn matching(&self, topic: &str) -> Vec<Arc<SubscriberShared>> {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.matches(topic))
            .cloned()
            .collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<SubscriberShared>> {
        std::mem::take(&mut *self.subscribers.write())
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A live subscription returned by `subscribe` / `subscribe_channel`
///
/// Dropping the handle closes the subscription.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
    registry: Arc<Registry>,
    queue: CommandQueue,
    op_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id())
            .field("topics", &self.shared.topics())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<SubscriberShared>,
        registry: Arc<Registry>,
        queue: CommandQueue,
    ) -> Self {
        Self {
            shared,
            registry,
            queue,
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SubscriberShared> {
        &self.shared
    }

    /// Registry identifier of this subscription
    pub fn id(&self) -> SubscriberId {
        self.shared.id()
    }

    /// Formatted topics currently subscribed
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics()
    }

    /// Whether [`Subscription::close`] has run
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// LISTEN to each topic not yet subscribed
    ///
    /// Topics already held are skipped. A topic is recorded only after its
    /// LISTEN succeeded; the first failure is returned and later topics are
    /// not attempted.
    #[instrument(skip(self), fields(subscriber = %self.shared.id()))]
    pub async fn subscribe(&self, topics: &[&str]) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        for topic in topics {
            if self.shared.is_closed() {
                return Err(PubSubError::SubscriberClosed);
            }
            let channel = self.shared.format(topic);
            if self.shared.contains(&channel) {
                continue;
            }
            validate_channel(&channel)?;

            self.queue.listen(&self.shared, channel.clone()).await?;

            if !self.shared.add_topic(channel.clone()) {
                // closed while the LISTEN was in flight; the release posted
                // by close runs after it and gives the channel back
                return Err(PubSubError::SubscriberClosed);
            }
            debug!(channel = %channel, "Subscribed to topic");
        }
        Ok(())
    }

    /// UNLISTEN each subscribed topic
    #[instrument(skip(self), fields(subscriber = %self.shared.id()))]
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        for topic in topics {
            let channel = self.shared.format(topic);
            if !self.shared.contains(&channel) {
                continue;
            }

            self.queue
                .unlisten(self.shared.id(), channel.clone())
                .await?;

            self.shared.remove_topic(&channel);
            debug!(channel = %channel, "Unsubscribed from topic");
        }
        Ok(())
    }

    /// Stop delivery, close the channel sink and deregister; idempotent
    ///
    /// Every channel this subscriber holds in the listener loop is released,
    /// including ones from `subscribe`/`unsubscribe` calls that were abandoned
    /// before the loop got to them.
    pub fn close(&self) -> Result<()> {
        if !self.shared.close() {
            return Ok(());
        }
        self.registry.remove(self.shared.id());
        self.queue.release(self.shared.id());
        debug!(subscriber = %self.shared.id(), "Subscription closed");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[async_trait]
impl Consumer for Subscription {
    async fn subscribe(&self, topics: &[&str]) -> Result<()> {
        Subscription::subscribe(self, topics).await
    }

    async fn unsubscribe(&self, topics: &[&str]) -> Result<()> {
        Subscription::unsubscribe(self, topics).await
    }

    fn close(&self) -> Result<()> {
        Subscription::close(self)
    }
}
