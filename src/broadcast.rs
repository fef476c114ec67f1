//! Fan-out of received notifications to matching subscribers.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, warn};

use crate::listener::SharedStats;
use crate::subscriber::{Delivery, Registry, SubscriberShared};
use crate::types::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Dropped,
    HandlerFailed,
    Skipped,
}

/// Delivers notifications from the listener loop
///
/// Delivery is sequential: a slow handler delays everything behind it, and a
/// full channel delays the loop by at most that subscriber's send timeout.
#[derive(Debug, Clone)]
pub(crate) struct Broadcaster {
    registry: Arc<Registry>,
    stats: SharedStats,
}

impl Broadcaster {
    pub(crate) fn new(registry: Arc<Registry>, stats: SharedStats) -> Self {
        Self { registry, stats }
    }

    /// Deliver to every subscriber whose topic set contains the notification topic
    pub(crate) async fn broadcast(&self, notification: Notification) {
        let targets = self.registry.matching(&notification.topic);
        if targets.is_empty() {
            debug!(topic = %notification.topic, "No subscribers for notification");
            return;
        }

        for subscriber in targets {
            let outcome = self.deliver(&subscriber, &notification).await;
            let mut stats = self.stats.write();
            match outcome {
                Outcome::Delivered => stats.notifications_delivered += 1,
                Outcome::Dropped => stats.messages_dropped += 1,
                Outcome::HandlerFailed => stats.handler_errors += 1,
                Outcome::Skipped => {}
            }
        }
    }

    async fn deliver(
        &self,
        subscriber: &SubscriberShared,
        notification: &Notification,
    ) -> Outcome {
        // closed between the snapshot and now
        let Some(delivery) = subscriber.delivery() else {
            return Outcome::Skipped;
        };

        match delivery {
            Delivery::Handler(handler) => {
                let call = AssertUnwindSafe(handler.handle(notification)).catch_unwind();
                match call.await {
                    Ok(Ok(())) => Outcome::Delivered,
                    Ok(Err(e)) => {
                        warn!(
                            subscriber = %subscriber.id(),
                            topic = %notification.topic,
                            error = %e,
                            "Notification handler failed"
                        );
                        Outcome::HandlerFailed
                    }
                    Err(_) => {
                        error!(
                            subscriber = %subscriber.id(),
                            topic = %notification.topic,
                            "Notification handler panicked"
                        );
                        Outcome::HandlerFailed
                    }
                }
            }
            Delivery::Channel {
                sender,
                send_timeout,
            } => match sender.send_timeout(notification.clone(), send_timeout).await {
                Ok(()) => Outcome::Delivered,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        subscriber = %subscriber.id(),
                        topic = %notification.topic,
                        timeout_ms = send_timeout.as_millis() as u64,
                        "Subscriber channel full, dropping notification"
                    );
                    Outcome::Dropped
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(
                        subscriber = %subscriber.id(),
                        "Subscriber receiver dropped, skipping notification"
                    );
                    Outcome::Skipped
                }
            },
        }
    }
}
