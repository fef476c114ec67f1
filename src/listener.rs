//! # Listener loop
//!
//! The listener loop is the only task that ever touches the exclusive
//! listening connection. It alternates between two activities:
//!
//! - draining the command queue (LISTEN/UNLISTEN requested by subscribers), and
//! - waiting for the next notification.
//!
//! A connection blocked in a wait cannot run a command, so every wait is raced
//! against a per-iteration [`CancellationToken`] kept in a shared slot.
//! [`CommandQueue`] enqueues a request and cancels that token, the loop wakes
//! up, runs the request and starts a new wait.
//!
//! ```text
//!  subscribe ──► CommandQueue ──┐            ┌──► Broadcaster ──► subscribers
//!                 │ interrupt   ▼            │
//!                 └──────► [ listener loop ] ┘
//!                                │ exclusive connection
//!                                ▼
//!                            PostgreSQL
//! ```
//!
//! Channels are reference counted inside the loop by subscriber id: LISTEN hits
//! the wire only for the first holder of a channel and UNLISTEN only when the
//! last holder lets go. Requests are idempotent per subscriber, so a request
//! whose caller gave up can never release a channel on behalf of somebody
//! else. Closing a subscriber posts a release on an unbounded queue that the
//! loop drains together with the command queue; it is never dropped.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broadcast::Broadcaster;
use crate::connection::ListenConnection;
use crate::error::{PubSubError, Result};
use crate::subscriber::SubscriberShared;
use crate::types::{ChannelCommand, SubscriberId};

/// Statistics about the listener loop and delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub running: bool,
    pub channels_listening: usize,
    pub notifications_received: u64,
    pub notifications_delivered: u64,
    pub messages_dropped: u64,
    pub handler_errors: u64,
    pub wait_errors: u64,
    pub commands_executed: u64,
    pub command_errors: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

pub(crate) type SharedStats = Arc<RwLock<ListenerStats>>;

/// Slot holding the token of the wait currently in progress
type WaitSlot = Arc<Mutex<Option<CancellationToken>>>;

/// Registration request made on behalf of one subscriber
#[derive(Debug)]
pub(crate) enum Request {
    Listen {
        subscriber: Arc<SubscriberShared>,
        channel: String,
    },
    Unlisten {
        subscriber: SubscriberId,
        channel: String,
    },
}

impl Request {
    fn subscriber(&self) -> SubscriberId {
        match self {
            Self::Listen { subscriber, .. } => subscriber.id(),
            Self::Unlisten { subscriber, .. } => *subscriber,
        }
    }

    fn command(&self) -> ChannelCommand {
        match self {
            Self::Listen { channel, .. } => ChannelCommand::Listen(channel.clone()),
            Self::Unlisten { channel, .. } => ChannelCommand::Unlisten(channel.clone()),
        }
    }
}

/// A queued request and its result slot
#[derive(Debug)]
struct Command {
    request: Request,
    reply: oneshot::Sender<Result<()>>,
}

/// Sending half of the command and release queues
#[derive(Debug, Clone)]
pub(crate) struct CommandQueue {
    sender: mpsc::Sender<Command>,
    releases: mpsc::UnboundedSender<SubscriberId>,
    wait_slot: WaitSlot,
    timeout: Option<Duration>,
}

impl CommandQueue {
    /// Add `subscriber` to the holders of `channel`, sending LISTEN if it is the first
    pub(crate) async fn listen(
        &self,
        subscriber: &Arc<SubscriberShared>,
        channel: String,
    ) -> Result<()> {
        self.submit(Request::Listen {
            subscriber: Arc::clone(subscriber),
            channel,
        })
        .await
    }

    /// Remove `subscriber` from the holders of `channel`, sending UNLISTEN if it was the last
    pub(crate) async fn unlisten(&self, subscriber: SubscriberId, channel: String) -> Result<()> {
        self.submit(Request::Unlisten {
            subscriber,
            channel,
        })
        .await
    }

    /// Let go of every channel `subscriber` holds, without waiting
    ///
    /// Used from synchronous close paths. A stopped loop has nothing left to
    /// release.
    pub(crate) fn release(&self, subscriber: SubscriberId) {
        match self.releases.send(subscriber) {
            Ok(()) => self.interrupt_wait(),
            Err(_) => debug!(%subscriber, "Listener stopped, nothing to release"),
        }
    }

    /// Run a request on the listening connection and wait for its result
    ///
    /// Bounded by the configured command timeout. Dropping the returned future
    /// abandons the wait; the loop still applies the request later.
    #[instrument(skip_all, fields(subscriber = %request.subscriber(), sql = %request.command()))]
    async fn submit(&self, request: Request) -> Result<()> {
        let Some(timeout) = self.timeout else {
            return self.round_trip(request).await;
        };

        let sql = request.command().sql();
        match tokio::time::timeout(timeout, self.round_trip(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Listener command timed out"
                );
                Err(PubSubError::CommandTimeout { sql, timeout })
            }
        }
    }

    async fn round_trip(&self, request: Request) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.sender
            .send(Command { request, reply })
            .await
            .map_err(|_| PubSubError::ListenerStopped)?;

        self.interrupt_wait();

        result.await.map_err(|_| PubSubError::ListenerStopped)?
    }

    fn interrupt_wait(&self) {
        if let Some(token) = self.wait_slot.lock().as_ref() {
            token.cancel();
        }
    }
}

/// Handle to a spawned listener loop
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    queue: CommandQueue,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ListenerHandle {
    pub(crate) fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Wait for the loop to finish and return the connection close result
    ///
    /// The caller must have cancelled the shutdown token first. Only the first
    /// call observes the result, later calls return `Ok(())`.
    pub(crate) async fn join(&self) -> Result<()> {
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

enum WaitOutcome {
    Interrupted,
    Received(Result<crate::types::Notification>),
}

/// The loop owning the exclusive connection
pub(crate) struct Listener {
    connection: Box<dyn ListenConnection>,
    commands: mpsc::Receiver<Command>,
    releases: mpsc::UnboundedReceiver<SubscriberId>,
    wait_slot: WaitSlot,
    shutdown: CancellationToken,
    broadcaster: Broadcaster,
    /// Listened channels and the subscribers holding each of them
    channels: HashMap<String, HashSet<SubscriberId>>,
    stats: SharedStats,
    retry_backoff: Duration,
}

/// Settings for [`Listener::spawn`]
#[derive(Debug, Clone)]
pub(crate) struct ListenerSettings {
    pub queue_size: usize,
    pub command_timeout: Option<Duration>,
    pub retry_backoff: Duration,
}

impl Listener {
    /// Move the connection into a new loop task
    pub(crate) fn spawn(
        connection: Box<dyn ListenConnection>,
        broadcaster: Broadcaster,
        shutdown: CancellationToken,
        stats: SharedStats,
        settings: ListenerSettings,
    ) -> ListenerHandle {
        let (sender, commands) = mpsc::channel(settings.queue_size.max(1));
        let (release_sender, releases) = mpsc::unbounded_channel();
        let wait_slot: WaitSlot = Arc::new(Mutex::new(None));

        let listener = Self {
            connection,
            commands,
            releases,
            wait_slot: Arc::clone(&wait_slot),
            shutdown,
            broadcaster,
            channels: HashMap::new(),
            stats,
            retry_backoff: settings.retry_backoff,
        };

        listener.stats.write().running = true;
        let task = tokio::spawn(listener.run());

        ListenerHandle {
            queue: CommandQueue {
                sender,
                releases: release_sender,
                wait_slot,
                timeout: settings.command_timeout,
            },
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self) -> Result<()> {
        info!("Listener loop started");

        loop {
            // install the token before draining so a command queued after the
            // drain always finds a wait to interrupt
            let wait_token = self.shutdown.child_token();
            *self.wait_slot.lock() = Some(wait_token.clone());

            self.process_pending_commands().await;

            if self.shutdown.is_cancelled() {
                break;
            }

            let outcome = tokio::select! {
                biased;
                () = wait_token.cancelled() => WaitOutcome::Interrupted,
                received = self.connection.recv() => WaitOutcome::Received(received),
            };
            self.wait_slot.lock().take();

            match outcome {
                WaitOutcome::Interrupted => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                }
                WaitOutcome::Received(Ok(notification)) => {
                    debug!(topic = %notification.topic, "Received notification");
                    {
                        let mut stats = self.stats.write();
                        stats.notifications_received += 1;
                        stats.last_notification_at = Some(Utc::now());
                    }
                    self.broadcaster.broadcast(notification).await;
                }
                WaitOutcome::Received(Err(e)) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    error!(error = %e, "Failed to wait for notification");
                    {
                        let mut stats = self.stats.write();
                        stats.wait_errors += 1;
                        stats.last_error_at = Some(Utc::now());
                    }
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn process_pending_commands(&mut self) {
        loop {
            if let Ok(Command { request, reply }) = self.commands.try_recv() {
                let result = self.execute(&request).await;
                match &result {
                    Err(PubSubError::SubscriberClosed) => {
                        debug!(sql = %request.command(), "Skipped command of a closed subscriber");
                    }
                    Err(e) => {
                        error!(sql = %request.command(), error = %e, "Failed to execute listener command");
                    }
                    Ok(()) => {}
                }
                // the caller may have timed out and gone away
                let _ = reply.send(result);
            } else if let Ok(subscriber) = self.releases.try_recv() {
                self.release(subscriber).await;
            } else {
                break;
            }
        }
    }

    async fn execute(&mut self, request: &Request) -> Result<()> {
        let result = match request {
            Request::Listen {
                subscriber,
                channel,
            } => self.listen(subscriber, channel).await,
            Request::Unlisten {
                subscriber,
                channel,
            } => self.unlisten(*subscriber, channel).await,
        };
        self.record(&result);
        result
    }

    async fn listen(&mut self, subscriber: &SubscriberShared, channel: &str) -> Result<()> {
        // its release may already have run; holding the channel now would leak it
        if subscriber.is_closed() {
            return Err(PubSubError::SubscriberClosed);
        }
        if let Some(holders) = self.channels.get_mut(channel) {
            holders.insert(subscriber.id());
            return Ok(());
        }

        self.connection
            .execute(&ChannelCommand::Listen(channel.to_string()))
            .await?;
        self.channels
            .insert(channel.to_string(), HashSet::from([subscriber.id()]));
        Ok(())
    }

    async fn unlisten(&mut self, subscriber: SubscriberId, channel: &str) -> Result<()> {
        let Some(holders) = self.channels.get_mut(channel) else {
            return Ok(());
        };
        if !holders.contains(&subscriber) {
            return Ok(());
        }
        if holders.len() > 1 {
            holders.remove(&subscriber);
            return Ok(());
        }

        self.connection
            .execute(&ChannelCommand::Unlisten(channel.to_string()))
            .await?;
        self.channels.remove(channel);
        Ok(())
    }

    /// Drop `subscriber` from every channel it holds
    async fn release(&mut self, subscriber: SubscriberId) {
        let held: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, holders)| holders.contains(&subscriber))
            .map(|(channel, _)| channel.clone())
            .collect();

        for channel in held {
            let result = self.unlisten(subscriber, &channel).await;
            if let Err(e) = &result {
                error!(%subscriber, channel = %channel, error = %e, "Failed to release channel");
                // nobody is left to retry; forget the holder so the next LISTEN hits the wire
                self.forget(subscriber, &channel);
            }
            self.record(&result);
        }
        debug!(%subscriber, "Released subscriber channels");
    }

    fn forget(&mut self, subscriber: SubscriberId, channel: &str) {
        if let Some(holders) = self.channels.get_mut(channel) {
            holders.remove(&subscriber);
            if holders.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    fn record(&self, result: &Result<()>) {
        let mut stats = self.stats.write();
        stats.channels_listening = self.channels.len();
        match result {
            Ok(()) => stats.commands_executed += 1,
            Err(_) => {
                stats.command_errors += 1;
                stats.last_error_at = Some(Utc::now());
            }
        }
    }

    async fn shutdown(mut self) -> Result<()> {
        self.wait_slot.lock().take();
        self.commands.close();
        self.releases.close();
        while let Ok(Command { reply, .. }) = self.commands.try_recv() {
            let _ = reply.send(Err(PubSubError::ListenerStopped));
        }

        let result = self.connection.close().await;
        {
            let mut stats = self.stats.write();
            stats.running = false;
            stats.channels_listening = 0;
        }

        match &result {
            Ok(()) => info!("Listener loop stopped"),
            Err(e) => warn!(error = %e, "Listener loop stopped, closing the connection failed"),
        }
        result
    }
}
