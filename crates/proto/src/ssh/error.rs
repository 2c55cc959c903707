//! Error types for the SSH core.
//!
//! Each component fails with its own enum; [`Error`] is the union returned by
//! the public [`Session`](super::Session) and [`Channel`](super::Channel)
//! operations.

use super::connection::OpenFailureReason;
use super::hostkey::Fingerprint;
use super::known_hosts::TrustDecision;
use super::message::disconnect;
use super::packet::PacketError;
use super::session::SessionState;
use super::version::VersionError;
use super::wire::WireError;
use ferrule_platform::CryptoError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for SSH operations
pub type Result<T> = std::result::Result<T, Error>;

/// Any failure surfaced by the SSH core.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket, handshake or transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Host key was not trusted.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// User authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Command execution request failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Channel-level failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Known-hosts store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local or remote resource limit.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Operation not valid in the session's current state.
    #[error("{operation} is not valid while the session is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time of the call
        state: SessionState,
    },
}

impl Error {
    /// Whether a fresh attempt (new connection, new credentials or a retried
    /// store write) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(err) => err.is_retryable(),
            Error::Store(_) => true,
            Error::Auth(AuthError::Rejected { .. }) => true,
            Error::Auth(AuthError::Transport(err)) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Transport establishment and delivery failure.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An operation did not finish in time; the transport was torn down.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that was running
        operation: &'static str,
        /// Limit that expired
        timeout: Duration,
    },

    /// The caller cancelled; the transport was torn down.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was running
        operation: &'static str,
    },

    /// Identification line exchange failed.
    #[error("version exchange failed: {0}")]
    Version(#[from] VersionError),

    /// No common algorithm in one negotiation category.
    #[error("no common {category} algorithm: {source}")]
    Negotiation {
        /// Category that failed (`kex`, `host key`, `cipher`, ...)
        category: &'static str,
        /// Provider error carrying both lists
        #[source]
        source: CryptoError,
    },

    /// Peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Provider failure outside record authentication.
    #[error("crypto provider error: {0}")]
    Crypto(CryptoError),

    /// The server's signature over the exchange hash did not verify.
    #[error("host key signature verification failed")]
    HostKeySignature,

    /// A record failed authentication; the transport is poisoned.
    #[error("integrity check failed on inbound packet {sequence}")]
    Integrity {
        /// Sequence number of the offending record
        sequence: u32,
    },

    /// Peer sent SSH_MSG_DISCONNECT.
    #[error("disconnected by peer: {} ({reason}): {description}", reason_label(.reason))]
    Disconnected {
        /// Reason code
        reason: u32,
        /// Free-form description from the peer
        description: String,
    },

    /// The stream reached end of file or the transport was shut down.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Whether reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::Io(_)
                | ConnectionError::Timeout { .. }
                | ConnectionError::Disconnected { .. }
                | ConnectionError::Closed
        )
    }

    /// Rebuilds an equivalent error for callers that observe a poisoned
    /// transport after the original was returned.
    pub(crate) fn replay(&self) -> ConnectionError {
        match self {
            ConnectionError::Integrity { sequence } => ConnectionError::Integrity {
                sequence: *sequence,
            },
            ConnectionError::Disconnected {
                reason,
                description,
            } => ConnectionError::Disconnected {
                reason: *reason,
                description: description.clone(),
            },
            ConnectionError::Timeout { operation, timeout } => ConnectionError::Timeout {
                operation: *operation,
                timeout: *timeout,
            },
            ConnectionError::Cancelled { operation } => ConnectionError::Cancelled {
                operation: *operation,
            },
            ConnectionError::HostKeySignature => ConnectionError::HostKeySignature,
            ConnectionError::Closed => ConnectionError::Closed,
            ConnectionError::Io(err) => ConnectionError::Io(io::Error::new(err.kind(), err.to_string())),
            other => ConnectionError::Protocol(other.to_string()),
        }
    }
}

fn reason_label(code: &u32) -> &'static str {
    disconnect::reason_name(*code)
}

impl From<CryptoError> for ConnectionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Integrity => ConnectionError::Integrity { sequence: 0 },
            other => ConnectionError::Crypto(other),
        }
    }
}

impl From<WireError> for ConnectionError {
    fn from(err: WireError) -> Self {
        ConnectionError::Protocol(err.to_string())
    }
}

impl From<PacketError> for ConnectionError {
    fn from(err: PacketError) -> Self {
        ConnectionError::Protocol(err.to_string())
    }
}

/// Host key was not accepted.
#[derive(Debug, Error)]
#[error("host key for {host}:{port} not trusted ({key_type} {fingerprint}): {decision}")]
pub struct TrustError {
    /// Host as configured
    pub host: String,
    /// Port as configured
    pub port: u16,
    /// Algorithm of the presented key
    pub key_type: String,
    /// Fingerprint of the presented key
    pub fingerprint: Fingerprint,
    /// Classification that led to the refusal
    pub decision: TrustDecision,
}

impl TrustError {
    /// Store failure behind the refusal, if classification itself failed.
    pub fn store_error(&self) -> Option<&StoreError> {
        match &self.decision {
            TrustDecision::Error(err) => Some(&**err),
            _ => None,
        }
    }
}

/// User authentication failure.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The method is allowed but the credentials were refused.
    #[error("{method} authentication rejected (partial success: {partial_success}, {remaining} attempts left)")]
    Rejected {
        /// Method that was tried
        method: &'static str,
        /// Server's partial-success flag
        partial_success: bool,
        /// Local attempts remaining
        remaining: u32,
    },

    /// The server does not accept this method.
    #[error("server does not offer {method} authentication (offers: {})", .offered.join(","))]
    MethodNotOffered {
        /// Method that was tried
        method: &'static str,
        /// Methods the server listed
        offered: Vec<String>,
    },

    /// The configured attempt limit has been reached.
    #[error("authentication attempts exhausted ({limit})")]
    AttemptsExhausted {
        /// Configured limit
        limit: u32,
    },

    /// Transport failed during authentication.
    #[error(transparent)]
    Transport(#[from] ConnectionError),
}

/// Command execution failure.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The server refused the exec request.
    #[error("server rejected exec on channel {channel}: {command:?}")]
    Rejected {
        /// Local channel id
        channel: u32,
        /// Command that was refused
        command: String,
    },

    /// `exec` was already requested on this channel.
    #[error("exec already requested on channel {channel}")]
    AlreadyRequested {
        /// Local channel id
        channel: u32,
    },

    /// The channel cannot carry an exec request in its current state.
    #[error("channel {channel} is {state}, not open")]
    NotOpen {
        /// Local channel id
        channel: u32,
        /// Channel state
        state: super::channel::ChannelState,
    },
}

/// Channel-scoped failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport failed while the channel was in use.
    #[error("channel {channel}: {source}")]
    Transport {
        /// Local channel id
        channel: u32,
        /// Underlying failure
        #[source]
        source: ConnectionError,
    },

    /// The peer sent more data than the granted window.
    #[error("channel {channel}: peer sent {received} bytes with only {window} granted")]
    WindowExceeded {
        /// Local channel id
        channel: u32,
        /// Bytes received
        received: u32,
        /// Window remaining at the time
        window: u32,
    },

    /// The peer violated the channel protocol.
    #[error("channel {channel}: {reason}")]
    Protocol {
        /// Local channel id
        channel: u32,
        /// Description
        reason: String,
    },

    /// The channel is closed.
    #[error("channel {channel} is closed")]
    Closed {
        /// Local channel id
        channel: u32,
    },

    /// The owning session was disconnected or dropped.
    #[error("channel {channel}: session closed")]
    SessionClosed {
        /// Local channel id
        channel: u32,
    },
}

/// Known-hosts store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the file failed.
    #[error("known hosts file {}: {source}", .path.display())]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A line could not be parsed.
    #[error("known hosts line {line}: {reason}")]
    Parse {
        /// 1-based line number (0 for a standalone line)
        line: usize,
        /// What was wrong
        reason: String,
    },

    /// A key or hostname could not be encoded for storage.
    #[error("cannot encode known hosts entry: {0}")]
    Encoding(String),
}

/// Resource limit failure.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The local channel limit is reached.
    #[error("channel limit of {limit} reached")]
    ChannelLimit {
        /// Configured limit
        limit: usize,
    },

    /// The server refused to open a channel.
    #[error("channel open rejected: {reason}: {description}")]
    OpenRejected {
        /// Reason code
        reason: OpenFailureReason,
        /// Server's description
        description: String,
    },
}
