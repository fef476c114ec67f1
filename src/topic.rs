//! # Topic naming and SQL quoting
//!
//! Topics are namespaced as `app:namespace:name` before they reach PostgreSQL.
//! The same formatting is applied on both the publish and the subscribe side,
//! so a publisher and a subscriber configured with the same app and namespace
//! always meet on the same channel.
//!
//! Channel names are SQL identifiers: PostgreSQL silently truncates identifiers
//! longer than [`MAX_CHANNEL_NAME_LEN`] bytes, which would make the channel a
//! notification arrives on differ from the one a subscriber registered. Such
//! topics are rejected up front instead.

use crate::error::{PubSubError, Result};

/// Default application prefix
pub const DEFAULT_APP: &str = "app";

/// Default namespace prefix
pub const DEFAULT_NAMESPACE: &str = "default";

/// Longest channel name PostgreSQL keeps intact (NAMEDATALEN - 1)
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

/// Hard PostgreSQL limit for a NOTIFY payload ("shorter than 8000 bytes")
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Join app, namespace and topic name into a channel name
///
/// ```rust
/// use pg_pubsub::topic::format_topic;
///
/// assert_eq!(format_topic("app", "default", "orders"), "app:default:orders");
/// ```
pub fn format_topic(app: &str, namespace: &str, topic: &str) -> String {
    format!("{app}:{namespace}:{topic}")
}

/// Check that a formatted channel name survives the trip through PostgreSQL
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(PubSubError::invalid_topic(channel, "channel name is empty"));
    }
    if channel.ends_with(':') {
        return Err(PubSubError::invalid_topic(channel, "topic name is empty"));
    }
    if channel.len() > MAX_CHANNEL_NAME_LEN {
        return Err(PubSubError::invalid_topic(
            channel,
            format!(
                "channel name is {} bytes, PostgreSQL keeps at most {MAX_CHANNEL_NAME_LEN}",
                channel.len()
            ),
        ));
    }
    if channel.contains('\0') {
        return Err(PubSubError::invalid_topic(
            channel,
            "channel name contains a NUL byte",
        ));
    }
    Ok(())
}

/// Quote a channel name as a SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote text as a standard-conforming SQL string literal
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Validate a raw payload and borrow it as NOTIFY text
pub(crate) fn notify_payload(payload: &[u8], limit: usize) -> Result<&str> {
    if payload.len() > limit {
        return Err(PubSubError::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let text = std::str::from_utf8(payload)
        .map_err(|e| PubSubError::invalid_payload(format!("payload is not UTF-8: {e}")))?;
    if text.contains('\0') {
        return Err(PubSubError::invalid_payload("payload contains a NUL byte"));
    }
    Ok(text)
}
