//! Inbound message routing and operation guards.
//!
//! A session owns one [`Connection`]: the transport plus the channel table,
//! behind a single `tokio::sync::Mutex`. Whoever holds the lock is the only
//! writer and pumps inbound messages into per-channel buffers until the
//! condition it waits for holds. There is no background task.

use super::cancel::CancelToken;
use super::channel::ChannelTable;
use super::connection::{ConnectionMessage, OpenFailureReason};
use super::error::{ConnectionError, Error, Result};
use super::message::{self, MessageType};
use super::session::SessionState;
use super::transport::Transport;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport and channel table, locked as one unit.
pub(crate) struct Connection {
    pub(crate) transport: Option<Transport>,
    pub(crate) channels: ChannelTable,
}

impl Connection {
    pub(crate) fn new(channels: ChannelTable) -> Self {
        Self {
            transport: None,
            channels,
        }
    }

    /// Whether a transport is installed.
    pub(crate) fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn transport(&mut self) -> std::result::Result<&mut Transport, ConnectionError> {
        self.transport.as_mut().ok_or(ConnectionError::Closed)
    }

    pub(crate) async fn send(
        &mut self,
        message: &ConnectionMessage,
    ) -> std::result::Result<(), ConnectionError> {
        self.transport()?.send(&message.to_bytes()).await
    }

    /// Receives one message and routes it.
    pub(crate) async fn pump(&mut self) -> std::result::Result<(), ConnectionError> {
        self.flush_abandoned().await?;

        let payload = self.transport()?.recv().await?;
        let message = match ConnectionMessage::from_bytes(&payload) {
            Ok(message) => message,
            Err(e) if MessageType::is_connection(payload[0]) => {
                return Err(ConnectionError::Protocol(format!(
                    "malformed {}: {}",
                    message::describe(payload[0]),
                    e
                )));
            }
            Err(_) => {
                warn!("Ignoring unexpected {}", message::describe(payload[0]));
                return Ok(());
            }
        };
        self.route(message).await
    }

    async fn route(&mut self, message: ConnectionMessage) -> std::result::Result<(), ConnectionError> {
        match message {
            ConnectionMessage::GlobalRequest { name, want_reply } => {
                debug!("Refusing global request {}", name);
                if want_reply {
                    self.send(&ConnectionMessage::RequestFailure).await?;
                }
            }
            ConnectionMessage::Open {
                channel_type,
                sender,
                ..
            } => {
                warn!("Refusing {} channel opened by server", channel_type);
                self.send(&ConnectionMessage::OpenFailure {
                    recipient: sender,
                    reason: OpenFailureReason::AdministrativelyProhibited,
                    description: "channel opens from the server are not accepted".to_string(),
                })
                .await?;
            }
            ConnectionMessage::RequestFailure => {}
            other => {
                let Some(id) = other.recipient() else {
                    return Ok(());
                };
                let reply = match self.channels.get_mut(id) {
                    Some(slot) => slot.handle(other),
                    None => {
                        warn!("Dropping message for unknown channel {}", id);
                        None
                    }
                };
                if let Some(reply) = reply {
                    self.send(&reply).await?;
                }
            }
        }
        Ok(())
    }

    /// Closes channels whose handles were dropped while open.
    async fn flush_abandoned(&mut self) -> std::result::Result<(), ConnectionError> {
        for close in self.channels.take_abandoned_closes() {
            self.send(&close).await?;
        }
        self.channels.reap();
        Ok(())
    }
}

/// State shared by a session and its channels.
pub(crate) struct Shared {
    pub(crate) conn: tokio::sync::Mutex<Connection>,
    state: parking_lot::Mutex<SessionState>,
    cancel: CancelToken,
    operation_timeout: Duration,
}

impl Shared {
    pub(crate) fn new(channels: ChannelTable, cancel: CancelToken, operation_timeout: Duration) -> Self {
        Self {
            conn: tokio::sync::Mutex::new(Connection::new(channels)),
            state: parking_lot::Mutex::new(SessionState::Disconnected),
            cancel,
            operation_timeout,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Session state {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Whether channel traffic may still flow: a transport is installed and
    /// the session was not closed, even by a drop that found the lock busy.
    pub(crate) fn is_live(&self, conn: &Connection) -> bool {
        conn.is_connected() && self.state() != SessionState::Closed
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Runs `operation` bounded by the operation timeout and the cancel
    /// token. Either one tears the transport down and closes the session.
    pub(crate) async fn guarded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(self.operation_timeout, fut) => Some(result),
        };

        let err = match outcome {
            Some(Ok(result)) => return result,
            Some(Err(_)) => ConnectionError::Timeout {
                operation,
                timeout: self.operation_timeout,
            },
            None => ConnectionError::Cancelled { operation },
        };
        warn!("{}", err);
        self.teardown().await;
        Err(Error::Connection(err))
    }

    /// Shuts the transport down and closes the session.
    pub(crate) async fn teardown(&self) {
        let mut conn = self.conn.lock().await;
        self.fail_locked(&mut conn).await;
    }

    /// [`teardown`](Self::teardown) for a caller already holding the lock.
    pub(crate) async fn fail_locked(&self, conn: &mut Connection) {
        if let Some(mut transport) = conn.transport.take() {
            let _ = tokio::time::timeout(self.operation_timeout, transport.shutdown()).await;
            info!("Transport torn down");
        }
        self.set_state(SessionState::Closed);
    }

    /// Tears down after a fatal transport error and hands the error back.
    pub(crate) async fn fatal(&self, conn: &mut Connection, err: ConnectionError) -> ConnectionError {
        warn!("Transport failed: {}", err);
        self.fail_locked(conn).await;
        err
    }
}
