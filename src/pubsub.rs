//! # PgPubSub facade
//!
//! Ties the pieces together: a [`NotifyPublisher`] for outbound NOTIFY, and a
//! lazily started listener loop plus [`Registry`] for subscriptions.
//!
//! The listener loop is started on the first subscribe, exactly once even
//! under concurrent first subscribes. [`PgPubSub::close`] is the only thing
//! that stops it.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::Broadcaster;
use crate::config::{PubSubConfig, PublishOptions, SubscribeOptions, SubscriberSettings};
use crate::connection::{ListenConnector, NotifyPool};
use crate::contract::{NotificationHandler, Publisher, Subscriber};
use crate::error::{PubSubError, Result};
use crate::listener::{Listener, ListenerHandle, ListenerSettings, ListenerStats, SharedStats};
use crate::publisher::NotifyPublisher;
use crate::subscriber::{Registry, Sink, SubscriberShared, Subscription};
use crate::types::Notification;

/// PostgreSQL LISTEN/NOTIFY publish/subscribe
///
/// ```rust,no_run
/// use pg_pubsub::{handler_fn, PgPubSub, PubSubConfig, PublishOptions, SubscribeOptions};
///
/// # async fn example() -> pg_pubsub::Result<()> {
/// let pubsub = PgPubSub::connect("postgresql://localhost/app", PubSubConfig::default()).await?;
///
/// let subscription = pubsub
///     .subscribe(
///         "orders",
///         handler_fn(|n| {
///             println!("{}: {:?}", n.topic, n.payload_str());
///             Ok(())
///         }),
///         SubscribeOptions::new(),
///     )
///     .await?;
///
/// pubsub.publish("orders", b"hello", PublishOptions::new()).await?;
///
/// subscription.close()?;
/// pubsub.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct PgPubSub {
    config: PubSubConfig,
    connector: Arc<dyn ListenConnector>,
    publisher: NotifyPublisher,
    registry: Arc<Registry>,
    stats: SharedStats,
    shutdown: CancellationToken,
    listener: OnceCell<ListenerHandle>,
}

impl std::fmt::Debug for PgPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPubSub")
            .field("config", &self.config)
            .field("started", &self.listener.initialized())
            .field("closed", &self.shutdown.is_cancelled())
            .field("subscribers", &self.registry.len())
            .finish()
    }
}

impl PgPubSub {
    /// Create an instance on an existing pool
    ///
    /// The pool serves both NOTIFY and the exclusive listening connection.
    pub fn new(pool: PgPool, config: PubSubConfig) -> Result<Self> {
        let pool = Arc::new(pool);
        Self::with_backend(pool.clone(), pool, config)
    }

    /// Connect a new pool sized by `config.max_connections`
    #[instrument(skip(database_url, config))]
    pub async fn connect(database_url: &str, config: PubSubConfig) -> Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "Connected pub/sub pool"
        );
        Self::new(pool, config)
    }

    /// Create an instance on any connection backend
    pub fn with_backend(
        connector: Arc<dyn ListenConnector>,
        pool: Arc<dyn NotifyPool>,
        config: PubSubConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            publisher: NotifyPublisher::new(pool, &config),
            config,
            connector,
            registry: Arc::new(Registry::default()),
            stats: SharedStats::default(),
            shutdown: CancellationToken::new(),
            listener: OnceCell::new(),
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Snapshot of the listener counters
    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Number of open subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether [`PgPubSub::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Publisher sharing this instance's pool and configuration
    pub fn publisher(&self) -> &NotifyPublisher {
        &self.publisher
    }

    /// Publish `payload` on `topic`
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        self.publisher.publish(topic, payload, options).await
    }

    /// Subscribe `handler` to `topic` and any topics in `options`
    ///
    /// Handlers run on the listener loop one after another; a slow handler
    /// delays delivery to everybody behind it.
    pub async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        H: NotificationHandler + 'static,
    {
        let settings = options.resolve(&self.config);
        let sink = Sink::Handler(Arc::new(handler));
        self.open_subscription(topic, &options.topics, &settings, sink)
            .await
    }

    /// Subscribe to `topic` and any topics in `options`, delivering into a
    /// bounded channel
    ///
    /// When the channel stays full for longer than the send timeout the
    /// notification is dropped for this subscriber.
    pub async fn subscribe_channel(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<(Subscription, mpsc::Receiver<Notification>)> {
        let settings = options.resolve(&self.config);
        let (sender, receiver) = mpsc::channel(settings.channel_size);
        let sink = Sink::Channel {
            sender: Some(sender),
            send_timeout: settings.send_timeout,
        };
        let subscription = self
            .open_subscription(topic, &options.topics, &settings, sink)
            .await?;
        Ok((subscription, receiver))
    }

    #[instrument(
        skip(self, extra_topics, settings, sink),
        fields(app = %settings.app, namespace = %settings.namespace)
    )]
    async fn open_subscription(
        &self,
        topic: &str,
        extra_topics: &[String],
        settings: &SubscriberSettings,
        sink: Sink,
    ) -> Result<Subscription> {
        let listener = self.ensure_started().await?;

        let shared = Arc::new(SubscriberShared::new(
            self.registry.next_id(),
            settings,
            sink,
        ));
        let subscription = Subscription::new(
            Arc::clone(&shared),
            Arc::clone(&self.registry),
            listener.queue().clone(),
        );

        let topics: Vec<&str> = std::iter::once(topic)
            .chain(extra_topics.iter().map(String::as_str))
            .collect();
        // on failure the handle drops here and releases what was listened
        if let Err(e) = subscription.subscribe(&topics).await {
            if e.is_shutdown() && self.shutdown.is_cancelled() {
                return Err(PubSubError::Closed);
            }
            return Err(e);
        }

        self.registry.add(Arc::clone(subscription.shared()));

        // close() may have drained the registry while we were listening
        if self.shutdown.is_cancelled() {
            subscription.close()?;
            return Err(PubSubError::Closed);
        }

        debug!(
            subscriber = %shared.id(),
            topics = ?subscription.topics(),
            "Subscription opened"
        );
        Ok(subscription)
    }

    /// Start the listener loop on first use
    async fn ensure_started(&self) -> Result<&ListenerHandle> {
        if self.shutdown.is_cancelled() {
            return Err(PubSubError::Closed);
        }

        self.listener
            .get_or_try_init(|| async {
                let connection = self.connector.connect().await?;
                let broadcaster =
                    Broadcaster::new(Arc::clone(&self.registry), Arc::clone(&self.stats));
                let settings = ListenerSettings {
                    queue_size: self.config.command_queue_size,
                    command_timeout: self.config.command_timeout(),
                    retry_backoff: self.config.wait_retry_backoff(),
                };
                Ok::<_, PubSubError>(Listener::spawn(
                    connection,
                    broadcaster,
                    self.shutdown.clone(),
                    Arc::clone(&self.stats),
                    settings,
                ))
            })
            .await
    }

    /// Stop the listener loop and close every subscription
    ///
    /// Waits for the loop to exit, so no delivery happens after this returns.
    /// Returns the error from closing the listening connection, if any.
    /// Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let first = !self.shutdown.is_cancelled();
        self.shutdown.cancel();

        let result = match self.listener.get() {
            Some(handle) => handle.join().await,
            None => Ok(()),
        };

        for subscriber in self.registry.drain() {
            // the loop is gone, released topics need no UNLISTEN
            subscriber.close();
        }

        if first {
            match &result {
                Ok(()) => info!("Pub/sub closed"),
                Err(e) => warn!(error = %e, "Pub/sub closed with error"),
            }
        }
        result
    }
}

#[async_trait]
impl Publisher for PgPubSub {
    async fn publish(&self, topic: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        PgPubSub::publish(self, topic, payload, options).await
    }
}

#[async_trait]
impl Subscriber for PgPubSub {
    type Consumer = Subscription;

    async fn subscribe<H>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        H: NotificationHandler + 'static,
    {
        PgPubSub::subscribe(self, topic, handler, options).await
    }

    async fn subscribe_channel(
        &self,
        topic: &str,
        options: SubscribeOptions,
    ) -> Result<(Subscription, mpsc::Receiver<Notification>)> {
        PgPubSub::subscribe_channel(self, topic, options).await
    }
}
