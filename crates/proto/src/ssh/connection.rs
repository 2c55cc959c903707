//! SSH connection protocol messages (RFC 4254).
//!
//! Everything after authentication is a [`ConnectionMessage`]: channel
//! lifecycle, flow control, data, and channel or global requests. Only the
//! `session` channel type and the requests needed to run a command are
//! modelled; other requests decode to [`ChannelRequest::Other`] so they can
//! be refused cleanly.
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::connection::{ConnectionMessage, CHANNEL_SESSION};
//!
//! let open = ConnectionMessage::Open {
//!     channel_type: CHANNEL_SESSION.to_string(),
//!     sender: 0,
//!     window: 64 * 1024,
//!     max_packet: 32 * 1024,
//! };
//! let bytes = open.to_bytes();
//! assert_eq!(ConnectionMessage::from_bytes(&bytes).unwrap(), open);
//! ```

use super::message::MessageType;
use super::wire::{Reader, SshBufMut, WireError};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// The only channel type this client opens.
pub const CHANNEL_SESSION: &str = "session";

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Reason code of SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED (1)
    AdministrativelyProhibited,
    /// SSH_OPEN_CONNECT_FAILED (2)
    ConnectFailed,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE (3)
    UnknownChannelType,
    /// SSH_OPEN_RESOURCE_SHORTAGE (4)
    ResourceShortage,
    /// Code outside RFC 4254.
    Other(u32),
}

impl OpenFailureReason {
    /// Maps a wire code.
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => OpenFailureReason::AdministrativelyProhibited,
            2 => OpenFailureReason::ConnectFailed,
            3 => OpenFailureReason::UnknownChannelType,
            4 => OpenFailureReason::ResourceShortage,
            other => OpenFailureReason::Other(other),
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            OpenFailureReason::AdministrativelyProhibited => 1,
            OpenFailureReason::ConnectFailed => 2,
            OpenFailureReason::UnknownChannelType => 3,
            OpenFailureReason::ResourceShortage => 4,
            OpenFailureReason::Other(code) => code,
        }
    }
}

impl fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenFailureReason::AdministrativelyProhibited => f.write_str("administratively prohibited"),
            OpenFailureReason::ConnectFailed => f.write_str("connect failed"),
            OpenFailureReason::UnknownChannelType => f.write_str("unknown channel type"),
            OpenFailureReason::ResourceShortage => f.write_str("resource shortage"),
            OpenFailureReason::Other(code) => write!(f, "reason {}", code),
        }
    }
}

/// Request-specific part of SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// `exec`: run a command.
    Exec {
        /// Command line
        command: String,
    },
    /// `exit-status` from the server.
    ExitStatus(u32),
    /// `exit-signal` from the server.
    ExitSignal {
        /// Signal name without the `SIG` prefix
        signal: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message
        message: String,
    },
    /// Any other request, identified by name. Its data is not kept.
    Other(String),
}

impl ChannelRequest {
    /// Request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequest::Exec { .. } => "exec",
            ChannelRequest::ExitStatus(_) => "exit-status",
            ChannelRequest::ExitSignal { .. } => "exit-signal",
            ChannelRequest::Other(name) => name,
        }
    }
}

/// A connection protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// SSH_MSG_CHANNEL_OPEN
    Open {
        /// Channel type (`session`)
        channel_type: String,
        /// Sender's channel number
        sender: u32,
        /// Initial window size
        window: u32,
        /// Maximum packet size
        max_packet: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation {
        /// Our channel number
        recipient: u32,
        /// Peer's channel number
        sender: u32,
        /// Peer's initial window
        window: u32,
        /// Peer's maximum packet size
        max_packet: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    OpenFailure {
        /// Our channel number
        recipient: u32,
        /// Reason code
        reason: OpenFailureReason,
        /// Human-readable description
        description: String,
    },
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust {
        /// Recipient channel
        recipient: u32,
        /// Bytes added to the window
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA
    Data {
        /// Recipient channel
        recipient: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Recipient channel
        recipient: u32,
        /// Data type code (1 = stderr)
        data_type: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EOF
    Eof {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    Close {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST
    Request {
        /// Recipient channel
        recipient: u32,
        /// Whether a SUCCESS/FAILURE reply is expected
        want_reply: bool,
        /// The request
        request: ChannelRequest,
    },
    /// SSH_MSG_CHANNEL_SUCCESS
    Success {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    Failure {
        /// Recipient channel
        recipient: u32,
    },
    /// SSH_MSG_GLOBAL_REQUEST. Request data is not kept.
    GlobalRequest {
        /// Request name
        name: String,
        /// Whether a reply is expected
        want_reply: bool,
    },
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
}

impl ConnectionMessage {
    /// Channel the message is addressed to, if any.
    pub fn recipient(&self) -> Option<u32> {
        use ConnectionMessage::*;
        match self {
            OpenConfirmation { recipient, .. }
            | OpenFailure { recipient, .. }
            | WindowAdjust { recipient, .. }
            | Data { recipient, .. }
            | ExtendedData { recipient, .. }
            | Eof { recipient }
            | Close { recipient }
            | Request { recipient, .. }
            | Success { recipient }
            | Failure { recipient } => Some(*recipient),
            Open { .. } | GlobalRequest { .. } | RequestFailure => None,
        }
    }

    /// Serializes to a payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        use ConnectionMessage::*;
        let mut buf = BytesMut::new();
        match self {
            Open {
                channel_type,
                sender,
                window,
                max_packet,
            } => {
                buf.put_u8(MessageType::ChannelOpen as u8);
                buf.put_ssh_string(channel_type.as_bytes());
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
            }
            OpenConfirmation {
                recipient,
                sender,
                window,
                max_packet,
            } => {
                buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
                buf.put_u32(*recipient);
                buf.put_u32(*sender);
                buf.put_u32(*window);
                buf.put_u32(*max_packet);
            }
            OpenFailure {
                recipient,
                reason,
                description,
            } => {
                buf.put_u8(MessageType::ChannelOpenFailure as u8);
                buf.put_u32(*recipient);
                buf.put_u32(reason.code());
                buf.put_ssh_string(description.as_bytes());
                buf.put_ssh_string(b"");
            }
            WindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                buf.put_u8(MessageType::ChannelWindowAdjust as u8);
                buf.put_u32(*recipient);
                buf.put_u32(*bytes_to_add);
            }
            Data { recipient, data } => {
                buf.put_u8(MessageType::ChannelData as u8);
                buf.put_u32(*recipient);
                buf.put_ssh_string(data);
            }
            ExtendedData {
                recipient,
                data_type,
                data,
            } => {
                buf.put_u8(MessageType::ChannelExtendedData as u8);
                buf.put_u32(*recipient);
                buf.put_u32(*data_type);
                buf.put_ssh_string(data);
            }
            Eof { recipient } => {
                buf.put_u8(MessageType::ChannelEof as u8);
                buf.put_u32(*recipient);
            }
            Close { recipient } => {
                buf.put_u8(MessageType::ChannelClose as u8);
                buf.put_u32(*recipient);
            }
            Request {
                recipient,
                want_reply,
                request,
            } => {
                buf.put_u8(MessageType::ChannelRequest as u8);
                buf.put_u32(*recipient);
                buf.put_ssh_string(request.name().as_bytes());
                buf.put_ssh_bool(*want_reply);
                match request {
                    ChannelRequest::Exec { command } => buf.put_ssh_string(command.as_bytes()),
                    ChannelRequest::ExitStatus(status) => buf.put_u32(*status),
                    ChannelRequest::ExitSignal {
                        signal,
                        core_dumped,
                        message,
                    } => {
                        buf.put_ssh_string(signal.as_bytes());
                        buf.put_ssh_bool(*core_dumped);
                        buf.put_ssh_string(message.as_bytes());
                        buf.put_ssh_string(b"");
                    }
                    ChannelRequest::Other(_) => {}
                }
            }
            Success { recipient } => {
                buf.put_u8(MessageType::ChannelSuccess as u8);
                buf.put_u32(*recipient);
            }
            Failure { recipient } => {
                buf.put_u8(MessageType::ChannelFailure as u8);
                buf.put_u32(*recipient);
            }
            GlobalRequest { name, want_reply } => {
                buf.put_u8(MessageType::GlobalRequest as u8);
                buf.put_ssh_string(name.as_bytes());
                buf.put_ssh_bool(*want_reply);
            }
            RequestFailure => buf.put_u8(MessageType::RequestFailure as u8),
        }
        buf.to_vec()
    }

    /// Parses a payload.
    ///
    /// # Errors
    ///
    /// [`WireError`] if the payload is truncated or not a connection
    /// protocol message.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let kind = reader.read_u8("message type")?;
        let Some(message_type) = MessageType::from_u8(kind) else {
            return Err(not_connection(kind));
        };

        let message = match message_type {
            MessageType::ChannelOpen => ConnectionMessage::Open {
                channel_type: reader.read_utf8("channel type")?.to_string(),
                sender: reader.read_u32("sender channel")?,
                window: reader.read_u32("initial window size")?,
                max_packet: reader.read_u32("maximum packet size")?,
            },
            MessageType::ChannelOpenConfirmation => ConnectionMessage::OpenConfirmation {
                recipient: reader.read_u32("recipient channel")?,
                sender: reader.read_u32("sender channel")?,
                window: reader.read_u32("initial window size")?,
                max_packet: reader.read_u32("maximum packet size")?,
            },
            MessageType::ChannelOpenFailure => ConnectionMessage::OpenFailure {
                recipient: reader.read_u32("recipient channel")?,
                reason: OpenFailureReason::from_u32(reader.read_u32("reason code")?),
                description: String::from_utf8_lossy(reader.read_string("description")?)
                    .into_owned(),
            },
            MessageType::ChannelWindowAdjust => ConnectionMessage::WindowAdjust {
                recipient: reader.read_u32("recipient channel")?,
                bytes_to_add: reader.read_u32("bytes to add")?,
            },
            MessageType::ChannelData => ConnectionMessage::Data {
                recipient: reader.read_u32("recipient channel")?,
                data: reader.read_string("data")?.to_vec(),
            },
            MessageType::ChannelExtendedData => ConnectionMessage::ExtendedData {
                recipient: reader.read_u32("recipient channel")?,
                data_type: reader.read_u32("data type code")?,
                data: reader.read_string("data")?.to_vec(),
            },
            MessageType::ChannelEof => ConnectionMessage::Eof {
                recipient: reader.read_u32("recipient channel")?,
            },
            MessageType::ChannelClose => ConnectionMessage::Close {
                recipient: reader.read_u32("recipient channel")?,
            },
            MessageType::ChannelRequest => {
                let recipient = reader.read_u32("recipient channel")?;
                let name = reader.read_utf8("request type")?;
                let want_reply = reader.read_bool("want reply")?;
                let request = match name {
                    "exec" => ChannelRequest::Exec {
                        command: String::from_utf8_lossy(reader.read_string("command")?)
                            .into_owned(),
                    },
                    "exit-status" => ChannelRequest::ExitStatus(reader.read_u32("exit status")?),
                    "exit-signal" => ChannelRequest::ExitSignal {
                        signal: reader.read_utf8("signal name")?.to_string(),
                        core_dumped: reader.read_bool("core dumped")?,
                        message: String::from_utf8_lossy(reader.read_string("error message")?)
                            .into_owned(),
                    },
                    other => ChannelRequest::Other(other.to_string()),
                };
                ConnectionMessage::Request {
                    recipient,
                    want_reply,
                    request,
                }
            }
            MessageType::ChannelSuccess => ConnectionMessage::Success {
                recipient: reader.read_u32("recipient channel")?,
            },
            MessageType::ChannelFailure => ConnectionMessage::Failure {
                recipient: reader.read_u32("recipient channel")?,
            },
            MessageType::GlobalRequest => ConnectionMessage::GlobalRequest {
                name: reader.read_utf8("request name")?.to_string(),
                want_reply: reader.read_bool("want reply")?,
            },
            MessageType::RequestFailure => ConnectionMessage::RequestFailure,
            _ => return Err(not_connection(kind)),
        };
        Ok(message)
    }
}

fn not_connection(kind: u8) -> WireError {
    WireError::Invalid {
        field: "message type",
        reason: format!("{} is not a connection protocol message", kind),
    }
}
