//! # Publisher / Subscriber contract
//!
//! Backend-neutral traits for publishing and subscribing. [`crate::PgPubSub`]
//! implements them on top of LISTEN/NOTIFY; other backends (and code such as
//! outbox relays that only needs "something to publish to") can depend on the
//! traits alone.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{PublishOptions, SubscribeOptions};
use crate::error::Result;
use crate::types::Notification;

/// Callback invoked for every notification delivered to a subscriber
///
/// Handlers run on the listener loop, one after another. Errors are logged
/// and never reach the publisher or other subscribers.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one notification
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// [`NotificationHandler`] wrapping a plain closure, see [`handler_fn`]
#[derive(Clone)]
pub struct FnHandler<F>(F);

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FnHandler").field(&"Fn").finish()
    }
}

/// Turn a closure into a [`NotificationHandler`]
///
/// ```rust
/// use pg_pubsub::contract::handler_fn;
///
/// let handler = handler_fn(|notification| {
///     println!("{} -> {:?}", notification.topic, notification.payload_str());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> NotificationHandler for FnHandler<F>
where
    F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, notification: &Notification) -> anyhow::Result<()> {
        (self.0)(notification)
    }
}

/// Handle of a live subscription
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Add topics to the subscription
    async fn subscribe(&self, topics: &[&str]) -> Result<()>;

    /// Remove topics from the subscription
    async fn unsubscribe(&self, topics: &[&str]) -> Result<()>;

    /// Stop all delivery to this subscription; idempotent
    fn close(&self) -> Result<()>;
}

/// Something that can publish payloads to topics
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: &[u8], options: PublishOptions) -> Result<()>;
}

/// Something that can hand out subscriptions
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscription handle type
    type Consumer: Consumer;

    /// Subscribe with a callback
    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Self::Consumer>
    where
        H: NotificationHandler + 'static;

    /// Subscribe with a bounded channel
    async fn subscribe_channel(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<(Self::Consumer, mpsc::Receiver<Notification>)>;
}
