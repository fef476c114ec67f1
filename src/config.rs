//! # Configuration for pg-pubsub
//!
//! [`PubSubConfig`] holds the instance-wide defaults (app and namespace prefix,
//! delivery timeouts, queue sizes). [`SubscribeOptions`] and [`PublishOptions`]
//! override them for a single call.
//!
//! Configuration can be layered with [`PubSubConfig::load`]: built-in defaults,
//! then an optional file (TOML, YAML or JSON by extension), then `PUBSUB_*`
//! environment variables such as `PUBSUB_APP` or `PUBSUB_SEND_TIMEOUT_MS`.
//!
//! # Examples
//!
//! ```rust
//! use pg_pubsub::config::PubSubConfig;
//! use std::time::Duration;
//!
//! let config = PubSubConfig::new()
//!     .with_app("billing")
//!     .with_namespace("prod")
//!     .with_send_timeout(Duration::from_secs(2));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.format_topic("invoice"), "billing:prod:invoice");
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PubSubError, Result};
use crate::topic::{
    format_topic, DEFAULT_APP, DEFAULT_NAMESPACE, MAX_CHANNEL_NAME_LEN, MAX_NOTIFY_PAYLOAD,
};

/// Environment variable prefix used by [`PubSubConfig::load`]
pub const ENV_PREFIX: &str = "PUBSUB";

/// Instance-wide pub/sub configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Application prefix of every topic
    pub app: String,

    /// Namespace prefix of every topic
    pub namespace: String,

    /// How long delivery to a full subscriber channel may wait before the
    /// message is dropped for that subscriber
    pub send_timeout_ms: u64,

    /// Buffer size of channels handed out by `subscribe_channel`
    pub channel_size: usize,

    /// Capacity of the LISTEN/UNLISTEN command queue
    pub command_queue_size: usize,

    /// Upper bound for a single LISTEN/UNLISTEN round trip (`None` waits forever)
    pub command_timeout_ms: Option<u64>,

    /// Pause after a failed notification wait before retrying
    pub wait_retry_backoff_ms: u64,

    /// Largest accepted publish payload in bytes
    pub max_payload_size: usize,

    /// Pool size used by [`crate::PgPubSub::connect`]
    pub max_connections: u32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            app: DEFAULT_APP.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            send_timeout_ms: 10_000,
            channel_size: 100,
            command_queue_size: 16,
            command_timeout_ms: Some(10_000),
            wait_retry_backoff_ms: 20,
            max_payload_size: MAX_NOTIFY_PAYLOAD,
            max_connections: 10,
        }
    }
}

impl PubSubConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then `path` (if any), then `PUBSUB_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config: Self = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Set the application prefix
    pub fn with_app<S: Into<String>>(mut self, app: S) -> Self {
        self.app = app.into();
        self
    }

    /// Set the namespace prefix
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the channel send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the subscriber channel buffer size
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }

    /// Set the command queue capacity
    pub fn with_command_queue_size(mut self, size: usize) -> Self {
        self.command_queue_size = size;
        self
    }

    /// Set or clear the LISTEN/UNLISTEN round-trip timeout
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout_ms = timeout.map(duration_ms);
        self
    }

    /// Set the retry backoff after a failed notification wait
    pub fn with_wait_retry_backoff(mut self, backoff: Duration) -> Self {
        self.wait_retry_backoff_ms = duration_ms(backoff);
        self
    }

    /// Set the maximum payload size, capped at the PostgreSQL limit
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(MAX_NOTIFY_PAYLOAD);
        self
    }

    /// Set the pool size used when connecting from a URL
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Channel send timeout
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// LISTEN/UNLISTEN round-trip timeout
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Retry backoff after a failed notification wait
    pub fn wait_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_retry_backoff_ms)
    }

    /// Format a topic with this configuration's app and namespace
    pub fn format_topic(&self, topic: &str) -> String {
        format_topic(&self.app, &self.namespace, topic)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(PubSubError::config("app cannot be empty"));
        }
        if self.namespace.is_empty() {
            return Err(PubSubError::config("namespace cannot be empty"));
        }
        // leave room for at least a one-byte topic name
        if self.format_topic("").len() >= MAX_CHANNEL_NAME_LEN {
            return Err(PubSubError::config(format!(
                "app and namespace leave no room for a topic within {MAX_CHANNEL_NAME_LEN} bytes"
            )));
        }
        if self.channel_size == 0 {
            return Err(PubSubError::config("channel_size must be at least 1"));
        }
        if self.command_queue_size == 0 {
            return Err(PubSubError::config("command_queue_size must be at least 1"));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(PubSubError::config(
                "command_timeout_ms must be positive (omit it to wait without a limit)",
            ));
        }
        if self.max_payload_size == 0 || self.max_payload_size > MAX_NOTIFY_PAYLOAD {
            return Err(PubSubError::config(format!(
                "max_payload_size must be between 1 and {MAX_NOTIFY_PAYLOAD} bytes (pg_notify limit)"
            )));
        }
        if self.max_connections == 0 {
            return Err(PubSubError::config("max_connections must be at least 1"));
        }
        Ok(())
    }
}

/// Per-subscription overrides
///
/// ```rust
/// use pg_pubsub::config::SubscribeOptions;
/// use std::time::Duration;
///
/// let options = SubscribeOptions::new()
///     .with_topics(["refunds"])
///     .with_namespace("prod")
///     .with_send_timeout(Duration::from_millis(200))
///     .with_channel_size(16);
/// assert_eq!(options.topics, vec!["refunds".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Additional topics registered together with the main topic
    pub topics: Vec<String>,
    /// App prefix override
    pub app: Option<String>,
    /// Namespace prefix override
    pub namespace: Option<String>,
    /// Channel send timeout override
    pub send_timeout: Option<Duration>,
    /// Channel buffer size override
    pub channel_size: Option<usize>,
}

impl SubscribeOptions {
    /// Options with no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Register these topics in addition to the main topic
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Override the app prefix
    pub fn with_app<S: Into<String>>(mut self, app: S) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Override the namespace prefix
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Override the channel send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Override the channel buffer size
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = Some(size);
        self
    }

    pub(crate) fn resolve(&self, config: &PubSubConfig) -> SubscriberSettings {
        SubscriberSettings {
            app: self.app.clone().unwrap_or_else(|| config.app.clone()),
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| config.namespace.clone()),
            send_timeout: self.send_timeout.unwrap_or_else(|| config.send_timeout()),
            channel_size: self.channel_size.unwrap_or(config.channel_size).max(1),
        }
    }
}

/// Effective settings of one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriberSettings {
    pub app: String,
    pub namespace: String,
    pub send_timeout: Duration,
    pub channel_size: usize,
}

/// Per-publish overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// App prefix override
    pub app: Option<String>,
    /// Namespace prefix override
    pub namespace: Option<String>,
}

impl PublishOptions {
    /// Options with no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the app prefix
    pub fn with_app<S: Into<String>>(mut self, app: S) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Override the namespace prefix
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
