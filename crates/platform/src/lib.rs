//! # Ferrule Platform
//!
//! The cryptographic boundary of the Ferrule SSH client core.
//!
//! The protocol engine in `ferrule-proto` never touches a cipher, curve or
//! signature scheme directly. Everything it needs is requested through the
//! traits in this crate:
//!
//! - [`CryptoProvider`]: algorithm lists, negotiation, key agreement,
//!   packet ciphers, signature verification and hashing
//! - [`KeyAgreement`]: one ephemeral key exchange
//! - [`PacketCipher`]: authenticated encryption of one direction of a transport
//! - [`HostKeySigner`]: signing with a long-term host key (server role)
//!
//! Failures are reported as [`CryptoError`].
//!
//! # Examples
//!
//! ```
//! use ferrule_platform::{negotiate_first_match, CryptoError};
//!
//! let client = vec!["aes256-gcm@openssh.com".to_string(), "aes128-gcm@openssh.com".to_string()];
//! let server = vec!["aes128-gcm@openssh.com".to_string(), "aes256-gcm@openssh.com".to_string()];
//!
//! // The client's preference order wins.
//! assert_eq!(negotiate_first_match(&client, &server)?, "aes256-gcm@openssh.com");
//! # Ok::<(), CryptoError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{CryptoError, CryptoResult};
pub use traits::{
    negotiate_first_match, CryptoProvider, HashAlgorithm, HostKeySigner, KeyAgreement,
    PacketCipher,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
