//! Client session: connect, verify the host, authenticate, open channels.
//!
//! # Session States
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> HostVerifying
//!              -> Authenticating -> Authenticated -> Closed
//! ```
//!
//! Any fatal transport error, timeout or cancellation moves the session to
//! `Closed`. Calls made in the wrong state fail with
//! [`Error::InvalidState`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ferrule_proto::ssh::auth::Credentials;
//! use ferrule_proto::ssh::channel::ChannelRead;
//! use ferrule_proto::ssh::config::SessionConfig;
//! use ferrule_proto::ssh::Session;
//!
//! # #[tokio::main]
//! # async fn main() -> ferrule_proto::ssh::error::Result<()> {
//! let mut session = Session::new(SessionConfig::new("localhost", "alice"));
//! session.connect().await?;
//! session.verify_host(|key, decision| {
//!     println!("{} ({})", key.fingerprint(), decision);
//!     true
//! }).await?;
//! session.authenticate(&Credentials::password("alice", "secret")).await?;
//!
//! let mut channel = session.open_channel().await?;
//! channel.request_exec("ps aux").await?;
//! while let ChannelRead::Data(chunk) = channel.read(8192).await? {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! channel.close().await?;
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use super::auth::{
    AuthMethod, AuthRequest, AuthResponse, Credentials, ServiceAccept, ServiceRequest,
    SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use super::cancel::CancelToken;
use super::channel::{Channel, ChannelTable};
use super::config::{SessionConfig, UnknownHostPolicy};
use super::crypto::RingCryptoProvider;
use super::dispatcher::{Connection, Shared};
use super::error::{AuthError, ConnectionError, Error, Result, StoreError, TrustError};
use super::hostkey::PublicKey;
use super::kex::NegotiatedAlgorithms;
use super::known_hosts::{KnownHostsStore, TrustDecision};
use super::message::disconnect;
use super::transport::{SshStream, Transport};
use super::version::Version;
use ferrule_platform::CryptoProvider;
use rand::RngCore;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected yet.
    Disconnected,
    /// Socket or handshake in progress.
    Connecting,
    /// Handshake done, host key not yet checked.
    Connected,
    /// Host key being checked.
    HostVerifying,
    /// Host trusted, user not yet authenticated.
    Authenticating,
    /// Channels may be opened.
    Authenticated,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::HostVerifying => "verifying the host key",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// SSH client session.
pub struct Session {
    config: SessionConfig,
    provider: Arc<dyn CryptoProvider>,
    known_hosts: Arc<KnownHostsStore>,
    shared: Arc<Shared>,

    server_key: Option<PublicKey>,
    server_version: Option<Version>,
    negotiated: Option<NegotiatedAlgorithms>,
    banner: Option<String>,

    userauth_ready: bool,
    auth_attempts: u32,
    offered_methods: Option<Vec<String>>,
}

impl Session {
    /// Creates a disconnected session.
    ///
    /// The known-hosts store comes from `config.known_hosts_path` (in memory
    /// when unset) and the crypto provider is [`RingCryptoProvider`].
    pub fn new(config: SessionConfig) -> Self {
        let store = match &config.known_hosts_path {
            Some(path) => KnownHostsStore::open(path),
            None => KnownHostsStore::in_memory(),
        }
        .hash_hostnames(config.hash_known_hosts);

        let shared = Arc::new(Self::shared_for(&config, CancelToken::new()));
        Self {
            provider: Arc::new(RingCryptoProvider::new()),
            known_hosts: Arc::new(store),
            shared,
            config,
            server_key: None,
            server_version: None,
            negotiated: None,
            banner: None,
            userauth_ready: false,
            auth_attempts: 0,
            offered_methods: None,
        }
    }

    fn shared_for(config: &SessionConfig, cancel: CancelToken) -> Shared {
        Shared::new(
            ChannelTable::new(
                config.max_channels,
                config.channel_buffer_size,
                config.max_packet_size,
            ),
            cancel,
            config.operation_timeout,
        )
    }

    /// Uses a shared known-hosts store.
    pub fn with_known_hosts(mut self, store: Arc<KnownHostsStore>) -> Self {
        self.known_hosts = store;
        self
    }

    /// Uses another crypto provider.
    pub fn with_crypto(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Observes `token`: cancelling it aborts the running operation and
    /// closes the session.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.shared = Arc::new(Self::shared_for(&self.config, token));
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Known-hosts store.
    pub fn known_hosts(&self) -> &Arc<KnownHostsStore> {
        &self.known_hosts
    }

    /// Cancel token observed by this session.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel_token().clone()
    }

    /// Host key the server presented.
    pub fn server_key(&self) -> Option<&PublicKey> {
        self.server_key.as_ref()
    }

    /// Server identification.
    pub fn server_version(&self) -> Option<&Version> {
        self.server_version.as_ref()
    }

    /// Algorithms of the first key exchange.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Authentication banner sent by the server, if any.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }

    /// Opens a TCP connection to `config.host:config.port` and runs the
    /// handshake.
    ///
    /// # Errors
    ///
    /// [`ConnectionError`] on socket, timeout or negotiation failure; the
    /// session is then Closed.
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state("connect", &[SessionState::Disconnected])?;
        self.shared.set_state(SessionState::Connecting);
        info!("Connecting to {}:{}", self.config.host, self.config.port);

        let address = (self.config.host.clone(), self.config.port);
        let timeout = self.config.connect_timeout;
        let cancel = self.shared.cancel_token().clone();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled { operation: "connect" }),
            result = tokio::time::timeout(timeout, TcpStream::connect(address)) => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(ConnectionError::Io(e)),
                Err(_) => Err(ConnectionError::Timeout { operation: "connect", timeout }),
            },
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connection to {}:{} failed: {}", self.config.host, self.config.port, e);
                self.shared.set_state(SessionState::Closed);
                return Err(e.into());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY: {}", e);
        }
        self.handshake(stream).await
    }

    /// Runs the handshake over a caller-supplied stream.
    pub async fn connect_stream<S: SshStream + 'static>(&mut self, stream: S) -> Result<()> {
        self.expect_state("connect", &[SessionState::Disconnected])?;
        self.shared.set_state(SessionState::Connecting);
        self.handshake(stream).await
    }

    async fn handshake<S: SshStream + 'static>(&mut self, stream: S) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handshake = handshake_step(
            stream,
            self.config.transport_config(),
            Arc::clone(&self.provider),
        );
        let transport = match shared.guarded("handshake", handshake).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                shared.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        self.server_key = transport.host_key().cloned();
        self.server_version = transport.peer_version().cloned();
        self.negotiated = transport.negotiated().cloned();
        if let (Some(version), Some(key)) = (&self.server_version, &self.server_key) {
            info!("Connected to {} running {}, host key {}", self.config.host, version, key);
        }

        shared.conn.lock().await.transport = Some(transport);
        shared.set_state(SessionState::Connected);
        Ok(())
    }

    /// Classifies the server key against the known-hosts store without
    /// acting on the result.
    pub fn host_decision(&self) -> Result<TrustDecision> {
        let key = self.presented_key("host_decision")?;
        Ok(self
            .known_hosts
            .classify(&self.config.host, self.config.port, key))
    }

    fn presented_key(&self, operation: &'static str) -> Result<&PublicKey> {
        self.server_key.as_ref().ok_or(Error::InvalidState {
            operation,
            state: self.state(),
        })
    }

    /// Checks the server key and records it when accepted.
    ///
    /// A matching key is accepted. An unknown host follows
    /// `config.unknown_host_policy`, calling `confirm` under
    /// [`UnknownHostPolicy::Ask`]. A host known only with other key types is
    /// accepted only if `confirm` agrees. Mismatches and unreadable stores
    /// are refused.
    ///
    /// # Errors
    ///
    /// [`TrustError`] when refused, [`StoreError`] when recording the key
    /// fails. Both close the session.
    pub async fn verify_host<F>(&mut self, confirm: F) -> Result<()>
    where
        F: FnOnce(&PublicKey, &TrustDecision) -> bool,
    {
        self.expect_state("verify_host", &[SessionState::Connected])?;
        let key = self.presented_key("verify_host")?.clone();
        self.shared.set_state(SessionState::HostVerifying);

        let (host, port) = (self.config.host.clone(), self.config.port);
        let decision = {
            let (host, key) = (host.clone(), key.clone());
            self.store_call("host verification", move |store| {
                Ok(store.classify(&host, port, &key))
            })
            .await?
        };
        debug!("Host key decision for {}:{}: {}", host, port, decision);

        let accepted = match &decision {
            TrustDecision::Match { .. } => true,
            TrustDecision::NotFound => match self.config.unknown_host_policy {
                UnknownHostPolicy::Ask => confirm(&key, &decision),
                UnknownHostPolicy::AcceptNew => true,
                UnknownHostPolicy::Refuse => false,
            },
            TrustDecision::UnknownKeyType { .. } => confirm(&key, &decision),
            TrustDecision::Mismatch { .. } | TrustDecision::Error(_) => false,
        };

        if !accepted {
            warn!("Host key {} for {}:{} not trusted: {}", key.fingerprint(), host, port, decision);
            self.close_with(disconnect::HOST_KEY_NOT_VERIFIABLE, "host key not trusted")
                .await;
            return Err(TrustError {
                host,
                port,
                key_type: key.algorithm().to_string(),
                fingerprint: key.fingerprint(),
                decision,
            }
            .into());
        }

        if !decision.is_match() {
            let recorded = self
                .store_call("host key recording", move |store| store.trust(&host, port, &key))
                .await;
            if let Err(e) = recorded {
                warn!("Cannot record host key: {}", e);
                self.close_with(disconnect::BY_APPLICATION, "cannot record host key")
                    .await;
                return Err(e);
            }
        }

        self.shared.set_state(SessionState::Authenticating);
        Ok(())
    }

    /// Runs a known-hosts call on the blocking pool, bounded like every other
    /// operation.
    async fn store_call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnOnce(&KnownHostsStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.known_hosts);
        self.shared
            .guarded(operation, store_step(store, operation, call))
            .await
    }

    /// Authenticates with a password.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Rejected`] if the server refused the credentials
    /// - [`AuthError::MethodNotOffered`] if the server does not accept
    ///   passwords
    /// - [`AuthError::AttemptsExhausted`] once `max_auth_attempts` were made
    /// - [`AuthError::Transport`] on transport failure; the session is closed
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        self.expect_state("authenticate", &[SessionState::Authenticating])?;

        let limit = self.config.max_auth_attempts;
        if self.auth_attempts >= limit {
            return Err(AuthError::AttemptsExhausted { limit }.into());
        }
        if let Some(offered) = &self.offered_methods {
            if !offered.iter().any(|m| m == "password") {
                return Err(AuthError::MethodNotOffered {
                    method: "password",
                    offered: offered.clone(),
                }
                .into());
            }
        }

        self.ensure_userauth().await?;
        self.auth_attempts += 1;
        debug!(
            "Password authentication for {} (attempt {} of {})",
            credentials.user(),
            self.auth_attempts,
            limit
        );

        let request = AuthRequest::new(credentials.user(), SERVICE_CONNECTION, credentials.method());
        match self.auth_round_trip(request).await? {
            AuthResponse::Success => {
                info!("Authenticated as {}", credentials.user());
                self.shared.set_state(SessionState::Authenticated);
                Ok(())
            }
            AuthResponse::Failure(failure) => {
                self.offered_methods = Some(failure.methods_can_continue().to_vec());
                if !failure.allows("password") {
                    return Err(AuthError::MethodNotOffered {
                        method: "password",
                        offered: failure.methods_can_continue().to_vec(),
                    }
                    .into());
                }
                warn!("Password rejected for {}", credentials.user());
                Err(AuthError::Rejected {
                    method: "password",
                    partial_success: failure.partial_success(),
                    remaining: limit - self.auth_attempts,
                }
                .into())
            }
            AuthResponse::PasswordChangeRequired(prompt) => {
                warn!("Server requires a password change: {}", prompt);
                Err(AuthError::Rejected {
                    method: "password",
                    partial_success: false,
                    remaining: limit - self.auth_attempts,
                }
                .into())
            }
            AuthResponse::Banner(_) => Err(AuthError::Transport(ConnectionError::Protocol(
                "unexpected banner".to_string(),
            ))
            .into()),
        }
    }

    /// Asks the server which methods it accepts, with a `none` request.
    ///
    /// Returns an empty list if the server let the user in without
    /// credentials; the session is then Authenticated.
    pub async fn auth_methods(&mut self) -> Result<Vec<String>> {
        self.expect_state("auth_methods", &[SessionState::Authenticating])?;
        self.ensure_userauth().await?;

        let request = AuthRequest::new(&self.config.user, SERVICE_CONNECTION, AuthMethod::None);
        match self.auth_round_trip(request).await? {
            AuthResponse::Success => {
                info!("Server accepted {} without credentials", self.config.user);
                self.shared.set_state(SessionState::Authenticated);
                Ok(Vec::new())
            }
            AuthResponse::Failure(failure) => {
                let methods = failure.methods_can_continue().to_vec();
                debug!("Server offers {:?}", methods);
                self.offered_methods = Some(methods.clone());
                Ok(methods)
            }
            other => Err(AuthError::Transport(ConnectionError::Protocol(format!(
                "unexpected answer to none request: {:?}",
                other
            )))
            .into()),
        }
    }

    async fn ensure_userauth(&mut self) -> Result<()> {
        if self.userauth_ready {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("service request", service_step(&shared))
            .await?;
        self.userauth_ready = true;
        Ok(())
    }

    async fn auth_round_trip(&mut self, request: AuthRequest) -> Result<AuthResponse> {
        let shared = Arc::clone(&self.shared);
        let (response, banners) = shared
            .guarded("authentication", auth_step(&shared, request))
            .await?;

        for banner in banners {
            info!("Server banner: {}", banner.trim_end());
            match &mut self.banner {
                Some(existing) => existing.push_str(&banner),
                None => self.banner = Some(banner),
            }
        }
        Ok(response)
    }

    /// Opens a session channel.
    ///
    /// # Errors
    ///
    /// [`ResourceError::ChannelLimit`](super::error::ResourceError::ChannelLimit)
    /// when `max_channels` are open,
    /// [`ResourceError::OpenRejected`](super::error::ResourceError::OpenRejected)
    /// when the server refuses.
    pub async fn open_channel(&self) -> Result<Channel> {
        self.expect_state("open_channel", &[SessionState::Authenticated])?;
        Channel::open(Arc::clone(&self.shared)).await
    }

    /// Sends SSH_MSG_IGNORE to keep the connection alive.
    pub async fn send_keepalive(&self) -> Result<()> {
        self.expect_state(
            "send_keepalive",
            &[
                SessionState::Connected,
                SessionState::HostVerifying,
                SessionState::Authenticating,
                SessionState::Authenticated,
            ],
        )?;

        let mut padding = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut padding);
        let shared = Arc::clone(&self.shared);
        shared
            .guarded("keepalive", keepalive_step(&shared, padding))
            .await
    }

    /// Disconnects. Safe from any state; later calls do nothing.
    pub async fn disconnect(&self) -> Result<()> {
        match self.state() {
            SessionState::Disconnected | SessionState::Closed => Ok(()),
            _ => {
                self.close_with(disconnect::BY_APPLICATION, "disconnected by user")
                    .await;
                info!("Disconnected from {}:{}", self.config.host, self.config.port);
                Ok(())
            }
        }
    }

    /// Sends DISCONNECT if the transport is healthy, shuts it down and
    /// closes the session. The transport is taken out exactly once.
    async fn close_with(&self, reason: u32, description: &str) {
        let timeout = self.shared.operation_timeout();
        match tokio::time::timeout(timeout, self.shared.conn.lock()).await {
            Ok(mut conn) => {
                if let Some(mut transport) = conn.transport.take() {
                    let goodbye = transport.disconnect(reason, description);
                    if tokio::time::timeout(timeout, goodbye).await.is_err() {
                        warn!("Disconnect did not finish within {:?}", timeout);
                    }
                }
            }
            Err(_) => warn!("Connection busy, closing without DISCONNECT"),
        }
        self.shared.set_state(SessionState::Closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state(), SessionState::Disconnected | SessionState::Closed) {
            return;
        }
        if let Ok(mut conn) = self.shared.conn.try_lock() {
            if conn.transport.take().is_some() {
                debug!("Session dropped without disconnect; transport released");
            }
        }
        self.shared.set_state(SessionState::Closed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .field("server_key", &self.server_key)
            .finish()
    }
}

async fn handshake_step<S: SshStream + 'static>(
    stream: S,
    config: super::transport::TransportConfig,
    provider: Arc<dyn CryptoProvider>,
) -> Result<Transport> {
    Ok(Transport::client(stream, config, provider).await?)
}

/// Set when the future waiting on a blocking store call is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Runs `call` on the blocking pool. A call still queued when the waiting
/// operation times out or is cancelled is skipped, so no host key is
/// recorded for a connection that already failed. A call that has started
/// runs to completion.
async fn store_step<T, F>(store: Arc<KnownHostsStore>, operation: &'static str, call: F) -> Result<T>
where
    F: FnOnce(&KnownHostsStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = store.path();
    let abandoned = Arc::new(AtomicBool::new(false));
    let _guard = AbandonOnDrop(Arc::clone(&abandoned));

    let task = tokio::task::spawn_blocking(move || {
        if abandoned.load(Ordering::SeqCst) {
            debug!("Skipping {}: nobody is waiting for it", operation);
            return Err(ConnectionError::Cancelled { operation }.into());
        }
        call(&store)
    });
    match task.await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Io {
            path: path.unwrap_or_else(|| PathBuf::from("<memory>")),
            source: io::Error::other(e),
        }
        .into()),
    }
}

/// Requests `ssh-userauth` and waits for SERVICE_ACCEPT.
async fn service_step(shared: &Shared) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    match request_service(&mut conn).await {
        Ok(()) => Ok(()),
        Err(e) => Err(AuthError::Transport(shared.fatal(&mut conn, e).await).into()),
    }
}

async fn request_service(conn: &mut Connection) -> std::result::Result<(), ConnectionError> {
    let transport = conn.transport()?;
    transport
        .send(&ServiceRequest::new(SERVICE_USERAUTH).to_bytes())
        .await?;
    let reply = transport.recv().await?;
    let accept = ServiceAccept::from_bytes(&reply)?;
    if accept.name() != SERVICE_USERAUTH {
        return Err(ConnectionError::Protocol(format!(
            "server accepted service {:?} instead of {}",
            accept.name(),
            SERVICE_USERAUTH
        )));
    }
    debug!("Service {} accepted", SERVICE_USERAUTH);
    Ok(())
}

/// Sends one USERAUTH_REQUEST and collects banners until the answer.
async fn auth_step(shared: &Shared, request: AuthRequest) -> Result<(AuthResponse, Vec<String>)> {
    let mut conn = shared.conn.lock().await;
    match exchange_auth(&mut conn, &request).await {
        Ok(answer) => Ok(answer),
        Err(e) => Err(AuthError::Transport(shared.fatal(&mut conn, e).await).into()),
    }
}

async fn exchange_auth(
    conn: &mut Connection,
    request: &AuthRequest,
) -> std::result::Result<(AuthResponse, Vec<String>), ConnectionError> {
    let transport = conn.transport()?;
    transport.send(&request.to_bytes()).await?;

    let mut banners = Vec::new();
    loop {
        let reply = transport.recv().await?;
        match AuthResponse::from_bytes(&reply)? {
            AuthResponse::Banner(banner) => banners.push(banner.message().to_string()),
            answer => return Ok((answer, banners)),
        }
    }
}

async fn keepalive_step(shared: &Shared, padding: [u8; 16]) -> Result<()> {
    let mut conn = shared.conn.lock().await;
    let sent = match conn.transport() {
        Ok(transport) => transport.send_ignore(&padding).await,
        Err(e) => Err(e),
    };
    match sent {
        Ok(()) => {
            debug!("Keepalive sent");
            Ok(())
        }
        Err(e) => Err(shared.fatal(&mut conn, e).await.into()),
    }
}
