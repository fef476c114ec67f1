//! In-memory LISTEN/NOTIFY broker for integration tests
//!
//! `MemoryBroker` plays both database roles: it hands out exclusive listening
//! connections and executes NOTIFY for the publisher. A notification reaches a
//! connection only if that connection executed LISTEN for the channel, like
//! PostgreSQL does.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pg_pubsub::{
    ChannelCommand, ListenConnection, ListenConnector, Notification, NotificationHandler,
    NotifyPool, NotifyStatement, PgPubSub, PubSubConfig, PubSubError, Result,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

#[derive(Default)]
struct BrokerState {
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    executed: Mutex<Vec<String>>,
    published: Mutex<Vec<String>>,
    failing_channels: Mutex<HashSet<String>>,
    connect_failures: AtomicUsize,
    connects: AtomicUsize,
}

struct ConnectionState {
    channels: Mutex<HashSet<String>>,
    inbox: mpsc::UnboundedSender<Result<Notification>>,
}

/// Shared in-memory database
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a `PgPubSub` backed by this broker
    pub fn pubsub(&self, config: PubSubConfig) -> PgPubSub {
        PgPubSub::with_backend(Arc::new(self.clone()), Arc::new(self.clone()), config)
            .expect("valid test config")
    }

    /// LISTEN/UNLISTEN statements that reached the wire, plus `CLOSE`
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// Number of wire LISTENs for `channel`
    pub fn listen_count(&self, channel: &str) -> usize {
        let sql = ChannelCommand::Listen(channel.to_string()).sql();
        self.executed().iter().filter(|s| **s == sql).count()
    }

    /// Number of wire UNLISTENs for `channel`
    pub fn unlisten_count(&self, channel: &str) -> usize {
        let sql = ChannelCommand::Unlisten(channel.to_string()).sql();
        self.executed().iter().filter(|s| **s == sql).count()
    }

    /// NOTIFY statements executed
    pub fn published(&self) -> Vec<String> {
        self.state.published.lock().clone()
    }

    /// Channels some open connection is listening on
    pub fn listening(&self) -> HashSet<String> {
        self.state
            .connections
            .lock()
            .iter()
            .flat_map(|c| c.channels.lock().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Make LISTEN on `channel` fail
    pub fn fail_listen(&self, channel: &str) {
        self.state
            .failing_channels
            .lock()
            .insert(channel.to_string());
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Deliver a wait error to every open connection
    pub fn inject_wait_error(&self) {
        for connection in self.state.connections.lock().iter() {
            let _ = connection
                .inbox
                .send(Err(PubSubError::connection("connection reset by peer")));
        }
    }
}

#[async_trait]
impl ListenConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn ListenConnection>> {
        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(PubSubError::connection("connection refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let (inbox, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionState {
            channels: Mutex::new(HashSet::new()),
            inbox,
        });
        self.state.connections.lock().push(Arc::clone(&connection));

        Ok(Box::new(MemoryConnection {
            connection,
            receiver,
            broker: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl NotifyPool for MemoryBroker {
    async fn notify(&self, statement: &NotifyStatement) -> Result<()> {
        self.state.published.lock().push(statement.sql());
        for connection in self.state.connections.lock().iter() {
            if connection.channels.lock().contains(&statement.channel) {
                let _ = connection.inbox.send(Ok(Notification::new(
                    statement.channel.clone(),
                    statement.payload.as_bytes(),
                )));
            }
        }
        Ok(())
    }
}

struct MemoryConnection {
    connection: Arc<ConnectionState>,
    receiver: mpsc::UnboundedReceiver<Result<Notification>>,
    broker: Arc<BrokerState>,
}

#[async_trait]
impl ListenConnection for MemoryConnection {
    async fn execute(&mut self, command: &ChannelCommand) -> Result<()> {
        if let ChannelCommand::Listen(channel) = command {
            if self.broker.failing_channels.lock().contains(channel) {
                return Err(PubSubError::connection(format!(
                    "permission denied for channel {channel}"
                )));
            }
        }

        self.broker.executed.lock().push(command.sql());
        let mut channels = self.connection.channels.lock();
        match command {
            ChannelCommand::Listen(channel) => {
                channels.insert(channel.clone());
            }
            ChannelCommand::Unlisten(channel) => {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        match self.receiver.recv().await {
            Some(received) => received,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.broker.executed.lock().push("CLOSE".to_string());
        self.connection.channels.lock().clear();
        self.broker
            .connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, &self.connection));
        Ok(())
    }
}

/// Handler that parks the listener loop until opened
#[derive(Clone)]
pub struct Gate {
    entered: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Number of notifications that reached the handler
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Let the parked call and every later one through
    pub fn open(&self) {
        self.permits.close();
    }
}

#[async_trait]
impl NotificationHandler for Gate {
    async fn handle(&self, _notification: &Notification) -> anyhow::Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        // acquire fails once the semaphore is closed
        let _ = self.permits.acquire().await;
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Receive one notification or fail after two seconds
pub async fn recv_within(receiver: &mut mpsc::Receiver<Notification>) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .ok()
        .flatten()
}

/// Assert nothing arrives for a short while
pub async fn assert_silent(receiver: &mut mpsc::Receiver<Notification>) {
    let received = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
    assert!(
        !matches!(received, Ok(Some(_))),
        "unexpected notification: {received:?}"
    );
}
