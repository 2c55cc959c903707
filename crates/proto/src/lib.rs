//! Protocol implementations for Ferrule.
//!
//! This crate provides a minimal SSH client core:
//!
//! - **Transport** - version exchange, curve25519-sha256 key exchange,
//!   AES-GCM packet protection and rekeying
//! - **Host trust** - an OpenSSH-compatible `known_hosts` store with
//!   trust-on-first-use and hashed hostnames
//! - **Authentication** - `none` and `password`
//! - **Channels** - `exec` sessions with flow control, stderr and exit status
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust,no_run
//! use ferrule_proto::ssh::{ChannelRead, Credentials, Session, SessionConfig, UnknownHostPolicy};
//!
//! # #[tokio::main]
//! # async fn main() -> ferrule_proto::ssh::Result<()> {
//! let config = SessionConfig::new("localhost", "alice")
//!     .with_unknown_host_policy(UnknownHostPolicy::AcceptNew);
//! let mut session = Session::new(config);
//! session.connect().await?;
//! session.verify_host(|_, _| false).await?;
//! session.authenticate(&Credentials::password("alice", "secret")).await?;
//!
//! let mut channel = session.open_channel().await?;
//! channel.request_exec("uname -a").await?;
//! let mut output = Vec::new();
//! while let ChannelRead::Data(chunk) = channel.read(4096).await? {
//!     output.extend_from_slice(&chunk);
//! }
//! println!("{}", String::from_utf8_lossy(&output));
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`)
//! - Constant-time comparison for hashed known-hosts entries
//! - Secure memory handling with `zeroize`
//! - Fuzz targets for the packet decoder
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
