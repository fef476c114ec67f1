//! NOTIFY publishing over the shared pool.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::config::{PubSubConfig, PublishOptions};
use crate::connection::NotifyPool;
use crate::contract::Publisher;
use crate::error::{PubSubError, Result};
use crate::topic::{format_topic, notify_payload, validate_channel};
use crate::types::NotifyStatement;

/// Publishes payloads with NOTIFY
///
/// Publishing never goes through the listener loop: each call acquires its
/// own pooled connection, so publishes run concurrently with each other and
/// with delivery.
#[derive(Clone)]
pub struct NotifyPublisher {
    pool: Arc<dyn NotifyPool>,
    app: String,
    namespace: String,
    max_payload_size: usize,
}

impl std::fmt::Debug for NotifyPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyPublisher")
            .field("pool", &"NotifyPool")
            .field("app", &self.app)
            .field("namespace", &self.namespace)
            .field("max_payload_size", &self.max_payload_size)
            .finish()
    }
}

impl NotifyPublisher {
    /// Create a publisher using the app, namespace and payload limit of `config`
    pub fn new(pool: Arc<dyn NotifyPool>, config: &PubSubConfig) -> Self {
        Self {
            pool,
            app: config.app.clone(),
            namespace: config.namespace.clone(),
            max_payload_size: config.max_payload_size,
        }
    }

    /// Build the NOTIFY statement for `topic` without sending it
    pub fn statement(
        &self,
        topic: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<NotifyStatement> {
        let app = options.app.as_deref().unwrap_or(&self.app);
        let namespace = options.namespace.as_deref().unwrap_or(&self.namespace);
        let channel = format_topic(app, namespace, topic);
        validate_channel(&channel)?;

        let payload = notify_payload(payload, self.max_payload_size)?;
        Ok(NotifyStatement {
            channel,
            payload: payload.to_string(),
        })
    }

    /// Publish `payload` on `topic`
    ///
    /// Publishing to a topic nobody listens on succeeds and is a no-op.
    #[instrument(skip(self, payload, options), fields(topic = %topic, size = payload.len()))]
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        let statement = self.statement(topic, payload, &options)?;

        self.pool.notify(&statement).await.map_err(|e| {
            error!(channel = %statement.channel, error = %e, "Failed to publish notification");
            e
        })?;

        debug!(channel = %statement.channel, "Published notification");
        Ok(())
    }

    /// Publish a value serialized as JSON
    pub async fn publish_json<T: serde::Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| PubSubError::invalid_payload(e.to_string()))?;
        self.publish(topic, &payload, options).await
    }
}

#[async_trait]
impl Publisher for NotifyPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        NotifyPublisher::publish(self, topic, payload, options).await
    }
}
