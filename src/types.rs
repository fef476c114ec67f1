//! # Shared types
//!
//! Value types exchanged between the facade, the listener loop and the
//! connection backends.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topic::{quote_ident, quote_literal};

/// A notification received on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Formatted channel name (`app:namespace:topic`)
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Notification {
    /// Create a notification
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Registration command executed on the exclusive listening connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelCommand {
    /// Start receiving notifications for a channel
    Listen(String),
    /// Stop receiving notifications for a channel
    Unlisten(String),
}

impl ChannelCommand {
    /// Channel the command applies to
    pub fn channel(&self) -> &str {
        match self {
            Self::Listen(channel) | Self::Unlisten(channel) => channel,
        }
    }

    /// SQL text of the command
    pub fn sql(&self) -> String {
        match self {
            Self::Listen(channel) => format!("LISTEN {}", quote_ident(channel)),
            Self::Unlisten(channel) => format!("UNLISTEN {}", quote_ident(channel)),
        }
    }
}

impl fmt::Display for ChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// A validated NOTIFY ready to be sent over a pooled connection
///
/// NOTIFY does not accept bound parameters for its payload, so the payload
/// is rendered as a quoted literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyStatement {
    /// Formatted channel name
    pub channel: String,
    /// Payload text
    pub payload: String,
}

impl NotifyStatement {
    /// SQL text of the statement
    pub fn sql(&self) -> String {
        format!(
            "NOTIFY {}, {}",
            quote_ident(&self.channel),
            quote_literal(&self.payload)
        )
    }
}

/// Identifier of a subscriber inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}
