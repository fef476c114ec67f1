//! Error types for pg-pubsub

use std::time::Duration;
use thiserror::Error;

/// Result type for pg-pubsub operations
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors that can occur in pg-pubsub operations
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Layered configuration could not be loaded
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    /// Topic cannot be used as a notification channel
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Payload cannot be carried by NOTIFY
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// Payload exceeds the configured NOTIFY payload limit
    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A LISTEN/UNLISTEN command did not complete in time
    #[error("Command `{sql}` did not complete within {timeout:?}")]
    CommandTimeout { sql: String, timeout: Duration },

    /// The listener loop is not running anymore
    #[error("Listener loop is not running")]
    ListenerStopped,

    /// The listener task panicked or was aborted
    #[error("Listener task failed: {0}")]
    ListenerTask(#[from] tokio::task::JoinError),

    /// The pub/sub instance has been closed
    #[error("Pub/sub has been closed")]
    Closed,

    /// The subscriber has been closed
    #[error("Subscriber is closed")]
    SubscriberClosed,

    /// Connection-level failure reported by a non-sqlx backend
    #[error("Connection error: {message}")]
    Connection { message: String },
}

impl PubSubError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid topic error
    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Whether the error means the instance can no longer register topics
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::ListenerStopped | Self::ListenerTask(_)
        )
    }
}
