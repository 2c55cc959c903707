//! Session configuration.

use super::packet::MAX_PACKET_SIZE;
use super::transport::TransportConfig;
use super::version::Version;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest channel buffer (and initial window) a session uses.
pub const MIN_CHANNEL_BUFFER_SIZE: u32 = 1024;

/// Smallest channel packet size a session announces.
pub const MIN_CHANNEL_PACKET_SIZE: u32 = 1024;

/// What to do with a host that is not in the known-hosts store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownHostPolicy {
    /// Ask the caller's confirmation callback.
    #[default]
    Ask,
    /// Trust and record the key without asking.
    AcceptNew,
    /// Refuse the connection.
    Refuse,
}

/// Configuration for a [`Session`](super::Session).
///
/// # Example
///
/// ```rust
/// use ferrule_proto::ssh::config::{SessionConfig, UnknownHostPolicy};
/// use std::time::Duration;
///
/// let config = SessionConfig::new("build.internal", "deploy")
///     .with_port(2222)
///     .with_operation_timeout(Duration::from_secs(10))
///     .with_unknown_host_policy(UnknownHostPolicy::Refuse);
/// assert_eq!(config.port, 2222);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,

    /// Server port (default: 22).
    pub port: u16,

    /// Remote user name.
    pub user: String,

    /// Software version in our identification line.
    pub software_version: String,

    /// Bound on establishing the TCP connection (default: 10 seconds).
    pub connect_timeout: Duration,

    /// Bound on every other suspension point (default: 30 seconds).
    pub operation_timeout: Duration,

    /// Known-hosts file. `None` keeps the store in memory.
    pub known_hosts_path: Option<PathBuf>,

    /// Write new known-hosts entries with hashed hostnames.
    pub hash_known_hosts: bool,

    /// First-use policy.
    pub unknown_host_policy: UnknownHostPolicy,

    /// Authentication attempts before giving up (default: 3).
    pub max_auth_attempts: u32,

    /// Per-channel receive buffer and initial window (default: 64 KiB, at
    /// least [`MIN_CHANNEL_BUFFER_SIZE`]).
    pub channel_buffer_size: u32,

    /// Largest channel data packet we accept (default: 32 KiB, at least
    /// [`MIN_CHANNEL_PACKET_SIZE`]).
    pub max_packet_size: u32,

    /// Concurrently open channels (default: 10).
    pub max_channels: usize,

    /// Rekey after this many bytes (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Rekey after this much time (default: 1 hour).
    pub rekey_time_limit: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            user: String::new(),
            software_version: format!("Ferrule_{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            known_hosts_path: None,
            hash_known_hosts: false,
            unknown_host_policy: UnknownHostPolicy::Ask,
            max_auth_attempts: 3,
            channel_buffer_size: 64 * 1024,
            max_packet_size: 32 * 1024,
            max_channels: 10,
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

impl SessionConfig {
    /// Configuration for `user@host` with defaults elsewhere.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the software version string.
    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = version.into();
        self
    }

    /// Sets the TCP connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Uses a known-hosts file.
    pub fn with_known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Hashes hostnames of new known-hosts entries.
    pub fn with_hashed_known_hosts(mut self, hashed: bool) -> Self {
        self.hash_known_hosts = hashed;
        self
    }

    /// Sets the first-use policy.
    pub fn with_unknown_host_policy(mut self, policy: UnknownHostPolicy) -> Self {
        self.unknown_host_policy = policy;
        self
    }

    /// Sets the authentication attempt limit.
    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.max_auth_attempts = attempts;
        self
    }

    /// Sets the channel buffer size, raised to [`MIN_CHANNEL_BUFFER_SIZE`]
    /// if smaller.
    pub fn with_channel_buffer_size(mut self, size: u32) -> Self {
        self.channel_buffer_size = size.max(MIN_CHANNEL_BUFFER_SIZE);
        self
    }

    /// Sets the maximum channel packet size, raised to
    /// [`MIN_CHANNEL_PACKET_SIZE`] if smaller.
    pub fn with_max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size.max(MIN_CHANNEL_PACKET_SIZE);
        self
    }

    /// Sets the channel limit.
    pub fn with_max_channels(mut self, channels: usize) -> Self {
        self.max_channels = channels;
        self
    }

    /// Sets the rekey thresholds.
    pub fn with_rekey_limits(mut self, bytes: u64, time: Duration) -> Self {
        self.rekey_bytes_limit = bytes;
        self.rekey_time_limit = time;
        self
    }

    /// Transport subset of this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            version: Version::new(&self.software_version, None),
            rekey_bytes_limit: self.rekey_bytes_limit,
            rekey_time_limit: self.rekey_time_limit,
            max_packet_size: MAX_PACKET_SIZE.max(self.max_packet_size as usize + 1024),
        }
    }
}
