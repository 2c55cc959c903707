//! SSH message numbers (RFC 4250 Section 4.1) and disconnect reason codes.
//!
//! Only the messages a password-authenticating exec client exchanges are
//! named. Anything else is reported by number.
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::from_u8(94), Some(MessageType::ChannelData));
//! assert_eq!(MessageType::ChannelData.to_string(), "SSH_MSG_CHANNEL_DATA(94)");
//! ```

use std::fmt;

/// SSH message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Ignored by the receiver; used for keepalives.
    Ignore = 2,
    /// Reply to a message the peer does not implement.
    Unimplemented = 3,
    /// Debugging text.
    Debug = 4,
    /// Requests a service such as `ssh-userauth`.
    ServiceRequest = 5,
    /// Accepts a service request.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switches to the freshly derived keys.
    NewKeys = 21,
    /// ECDH client ephemeral key (shares the number with KEXDH_INIT).
    KexEcdhInit = 30,
    /// ECDH server reply with host key and signature.
    KexEcdhReply = 31,
    /// Authentication request.
    UserauthRequest = 50,
    /// Authentication failure with the methods that may continue.
    UserauthFailure = 51,
    /// Authentication success.
    UserauthSuccess = 52,
    /// Pre-authentication banner.
    UserauthBanner = 53,
    /// Password change request (method specific number 60).
    UserauthPasswdChangereq = 60,
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Receive window increase.
    ChannelWindowAdjust = 93,
    /// Channel data (stdout).
    ChannelData = 94,
    /// Extended channel data (stderr).
    ChannelExtendedData = 95,
    /// No more data in this direction.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request (`exec`, `exit-status`, ...).
    ChannelRequest = 98,
    /// Channel request success.
    ChannelSuccess = 99,
    /// Channel request failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a message number.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use MessageType::*;
        Some(match byte {
            1 => Disconnect,
            2 => Ignore,
            3 => Unimplemented,
            4 => Debug,
            5 => ServiceRequest,
            6 => ServiceAccept,
            20 => KexInit,
            21 => NewKeys,
            30 => KexEcdhInit,
            31 => KexEcdhReply,
            50 => UserauthRequest,
            51 => UserauthFailure,
            52 => UserauthSuccess,
            53 => UserauthBanner,
            60 => UserauthPasswdChangereq,
            80 => GlobalRequest,
            81 => RequestSuccess,
            82 => RequestFailure,
            90 => ChannelOpen,
            91 => ChannelOpenConfirmation,
            92 => ChannelOpenFailure,
            93 => ChannelWindowAdjust,
            94 => ChannelData,
            95 => ChannelExtendedData,
            96 => ChannelEof,
            97 => ChannelClose,
            98 => ChannelRequest,
            99 => ChannelSuccess,
            100 => ChannelFailure,
            _ => return None,
        })
    }

    /// RFC name of the message.
    pub fn name(self) -> &'static str {
        use MessageType::*;
        match self {
            Disconnect => "SSH_MSG_DISCONNECT",
            Ignore => "SSH_MSG_IGNORE",
            Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            Debug => "SSH_MSG_DEBUG",
            ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            KexInit => "SSH_MSG_KEXINIT",
            NewKeys => "SSH_MSG_NEWKEYS",
            KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            UserauthPasswdChangereq => "SSH_MSG_USERAUTH_PASSWD_CHANGEREQ",
            GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            ChannelData => "SSH_MSG_CHANNEL_DATA",
            ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            ChannelEof => "SSH_MSG_CHANNEL_EOF",
            ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Whether a message number belongs to the key exchange range (20..=49).
    ///
    /// These are the only messages allowed between KEXINIT and NEWKEYS.
    pub fn is_key_exchange(byte: u8) -> bool {
        (20..=49).contains(&byte)
    }

    /// Whether a message number is in the connection protocol range (80..=127).
    pub fn is_connection(byte: u8) -> bool {
        (80..=127).contains(&byte)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Human readable label for any message number.
pub fn describe(byte: u8) -> String {
    match MessageType::from_u8(byte) {
        Some(kind) => kind.to_string(),
        None => format!("message {}", byte),
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect {
    /// Protocol error.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC or AEAD tag failure.
    pub const MAC_ERROR: u32 = 5;
    /// Host key could not be verified.
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Closed by the application.
    pub const BY_APPLICATION: u32 = 11;
    /// Authentication attempts exhausted.
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;

    /// Name of a reason code, for logs.
    pub fn reason_name(code: u32) -> &'static str {
        match code {
            1 => "HOST_NOT_ALLOWED_TO_CONNECT",
            2 => "PROTOCOL_ERROR",
            3 => "KEY_EXCHANGE_FAILED",
            4 => "RESERVED",
            5 => "MAC_ERROR",
            6 => "COMPRESSION_ERROR",
            7 => "SERVICE_NOT_AVAILABLE",
            8 => "PROTOCOL_VERSION_NOT_SUPPORTED",
            9 => "HOST_KEY_NOT_VERIFIABLE",
            10 => "CONNECTION_LOST",
            11 => "BY_APPLICATION",
            12 => "TOO_MANY_CONNECTIONS",
            13 => "AUTH_CANCELLED_BY_USER",
            14 => "NO_MORE_AUTH_METHODS_AVAILABLE",
            15 => "ILLEGAL_USER_NAME",
            _ => "UNKNOWN",
        }
    }
}
