#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pg-pubsub
//!
//! Topic-based publish/subscribe on top of PostgreSQL LISTEN/NOTIFY.
//!
//! ## Overview
//!
//! Many subscribers share **one** exclusive listening connection. A single
//! listener loop owns that connection, executes LISTEN/UNLISTEN commands queued
//! by subscribers and fans every received notification out to the subscribers
//! of its topic. Publishing is independent of the loop and uses pooled
//! connections.
//!
//! Topics are namespaced as `<app>:<namespace>:<topic>` on both sides, so a
//! publisher and a subscriber configured with the same app and namespace meet
//! on the same PostgreSQL channel.
//!
//! ## Module Organization
//!
//! - [`pubsub`] - The [`PgPubSub`] facade
//! - [`contract`] - Backend-neutral `Publisher` / `Subscriber` / `Consumer` traits
//! - [`subscriber`] - Subscription handles
//! - [`publisher`] - NOTIFY publishing
//! - [`listener`] - Listener loop statistics
//! - [`connection`] - Connection backends (PostgreSQL via SQLx)
//! - [`config`] - Configuration and per-call options
//! - [`topic`] - Topic formatting, validation and quoting
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_pubsub::{PgPubSub, PubSubConfig, PublishOptions, SubscribeOptions};
//!
//! # async fn example() -> pg_pubsub::Result<()> {
//! let pubsub = PgPubSub::connect("postgresql://localhost/app", PubSubConfig::default()).await?;
//!
//! let (subscription, mut notifications) = pubsub
//!     .subscribe_channel("orders", SubscribeOptions::new())
//!     .await?;
//!
//! pubsub.publish("orders", b"hello", PublishOptions::new()).await?;
//!
//! if let Some(notification) = notifications.recv().await {
//!     assert_eq!(notification.topic, "app:default:orders");
//!     assert_eq!(notification.payload, b"hello");
//! }
//!
//! subscription.close()?;
//! pubsub.close().await?;
//! # Ok(())
//! # }
//! ```

mod broadcast;
pub mod config;
pub mod connection;
pub mod contract;
pub mod error;
pub mod listener;
pub mod logging;
pub mod publisher;
pub mod pubsub;
pub mod subscriber;
pub mod topic;
pub mod types;

pub use config::{PubSubConfig, PublishOptions, SubscribeOptions};
pub use connection::{ListenConnection, ListenConnector, NotifyPool, PgListenConnection};
pub use contract::{handler_fn, Consumer, FnHandler, NotificationHandler, Publisher, Subscriber};
pub use error::{PubSubError, Result};
pub use listener::ListenerStats;
pub use publisher::NotifyPublisher;
pub use pubsub::PgPubSub;
pub use subscriber::Subscription;
pub use types::{ChannelCommand, Notification, NotifyStatement, SubscriberId};
