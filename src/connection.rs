//! # Connection backends
//!
//! The multiplexer needs two things from the database:
//!
//! 1. one exclusive connection that can run LISTEN/UNLISTEN and wait for the
//!    next notification ([`ListenConnector`] / [`ListenConnection`]), and
//! 2. a pool for independent NOTIFY commands ([`NotifyPool`]).
//!
//! Both are implemented for [`sqlx::PgPool`]. The exclusive side is backed by
//! [`sqlx::postgres::PgListener`], which re-issues LISTEN for every tracked
//! channel after a reconnect.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{Executor, PgPool};
use tracing::{debug, instrument};

use crate::error::{PubSubError, Result};
use crate::types::{ChannelCommand, Notification, NotifyStatement};

/// Opens the exclusive listening connection
#[async_trait]
pub trait ListenConnector: Send + Sync {
    /// Open a new exclusive connection
    async fn connect(&self) -> Result<Box<dyn ListenConnection>>;
}

/// Exclusive connection owned by the listener loop
///
/// Only the listener loop ever calls into this connection, so implementations
/// need not be shareable.
#[async_trait]
pub trait ListenConnection: Send {
    /// Execute a LISTEN/UNLISTEN command
    async fn execute(&mut self, command: &ChannelCommand) -> Result<()>;

    /// Wait for the next notification
    ///
    /// Must be cancel-safe: the listener races this future against an
    /// interrupt and drops it whenever a command has to run first. Dropping it
    /// must not lose a notification that was already received.
    async fn recv(&mut self) -> Result<Notification>;

    /// Stop listening and release the connection
    ///
    /// Called once, when the listener loop exits. Later calls to the other
    /// methods may fail.
    async fn close(&mut self) -> Result<()>;
}

/// Pool used for outbound NOTIFY commands
#[async_trait]
pub trait NotifyPool: Send + Sync {
    /// Acquire a connection, execute the NOTIFY and release the connection
    async fn notify(&self, statement: &NotifyStatement) -> Result<()>;
}

/// [`ListenConnection`] backed by [`PgListener`]
///
/// `close` runs `UNLISTEN *` and drops the listener, which hands the
/// underlying connection back to the pool it came from.
pub struct PgListenConnection {
    listener: Option<PgListener>,
}

impl std::fmt::Debug for PgListenConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgListenConnection")
            .field("open", &self.listener.is_some())
            .finish()
    }
}

impl PgListenConnection {
    /// Wrap an already connected listener
    pub fn new(listener: PgListener) -> Self {
        Self {
            listener: Some(listener),
        }
    }

    fn listener(&mut self) -> Result<&mut PgListener> {
        self.listener.as_mut().ok_or(PubSubError::ListenerStopped)
    }
}

#[async_trait]
impl ListenConnector for PgPool {
    async fn connect(&self) -> Result<Box<dyn ListenConnection>> {
        let listener = PgListener::connect_with(self).await?;
        debug!("Opened exclusive listening connection");
        Ok(Box::new(PgListenConnection::new(listener)))
    }
}

#[async_trait]
impl ListenConnection for PgListenConnection {
    async fn execute(&mut self, command: &ChannelCommand) -> Result<()> {
        // PgListener quotes the channel itself and remembers it for reconnects
        match command {
            ChannelCommand::Listen(channel) => self.listener()?.listen(channel).await?,
            ChannelCommand::Unlisten(channel) => self.listener()?.unlisten(channel).await?,
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Notification> {
        let notification = self.listener()?.recv().await?;
        Ok(Notification::new(
            notification.channel(),
            notification.payload().as_bytes(),
        ))
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut listener) = self.listener.take() else {
            return Ok(());
        };
        // dropped on both paths, returning the connection to the pool
        listener.unlisten_all().await?;
        debug!("Released exclusive listening connection");
        Ok(())
    }
}

#[async_trait]
impl NotifyPool for PgPool {
    #[instrument(skip(self, statement), fields(channel = %statement.channel))]
    async fn notify(&self, statement: &NotifyStatement) -> Result<()> {
        let mut conn = self.acquire().await?;
        let sql = statement.sql();
        // simple query protocol: NOTIFY takes no bind parameters
        (&mut *conn).execute(sql.as_str()).await?;
        Ok(())
    }
}
