//! SSH client core (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Framing** ([`packet`], [`wire`]) - binary packet protocol and field codecs
//! 2. **Transport** ([`transport`], [`kex`], [`crypto`]) - version exchange,
//!    curve25519 key exchange, AES-GCM records, rekeying
//! 3. **Host trust** ([`hostkey`], [`known_hosts`]) - server key fingerprints
//!    and the OpenSSH `known_hosts` store
//! 4. **Authentication** ([`auth`]) - `ssh-userauth` with `none` and `password`
//! 5. **Connection** ([`connection`], [`channel`]) - session channels, `exec`,
//!    flow control, exit status
//! 6. **Session** ([`session`]) - the state machine tying the layers together
//!
//! Cryptography goes through the [`ferrule_platform::CryptoProvider`] trait;
//! [`RingCryptoProvider`] is the default.
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths are checked before any body is buffered
//! - **Host Trust**: keys are compared by exact blob, mismatches are never accepted
//! - **Memory Safety**: passwords and key material are zeroized on drop
//! - **Bounded Waits**: every network operation has a timeout and observes
//!   a [`CancelToken`]
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-IGNORE payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-IGNORE payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 5647](https://datatracker.ietf.org/doc/html/rfc5647) - AES-GCM for SSH
//! - [RFC 8731](https://datatracker.ietf.org/doc/html/rfc8731) - curve25519-sha256

pub mod auth;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub(crate) mod dispatcher;
pub mod error;
pub mod hostkey;
pub mod kex;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, Credentials};
pub use cancel::CancelToken;
pub use channel::{Channel, ChannelRead, ChannelState, ExitSignal};
pub use config::{SessionConfig, UnknownHostPolicy};
pub use crypto::RingCryptoProvider;
pub use error::{
    AuthError, ChannelError, ConnectionError, Error, ExecError, ResourceError, Result,
    StoreError, TrustError,
};
pub use hostkey::{Ed25519HostKey, Fingerprint, PublicKey};
pub use known_hosts::{KnownHost, KnownHostsStore, TrustDecision};
pub use message::MessageType;
pub use packet::{Packet, PacketError};
pub use session::{Session, SessionState};
pub use transport::{Transport, TransportConfig};
pub use version::Version;
