//! SSH transport layer (RFC 4253).
//!
//! [`Transport`] turns a byte stream into an ordered, encrypted and
//! authenticated sequence of message payloads.
//!
//! # Transport States
//!
//! 1. **VersionExchange** - Exchange SSH-2.0 identification lines
//! 2. **KexInit** - Send/receive SSH_MSG_KEXINIT messages
//! 3. **KeyExchange** - Curve25519 ECDH and host key signature
//! 4. **NewKeys** - Send/receive SSH_MSG_NEWKEYS, install new keys
//! 5. **Encrypted** - All communication encrypted and authenticated
//! 6. **Failed** - Poisoned by an integrity or framing failure, a peer
//!    DISCONNECT or a local teardown; every call fails
//!
//! # Rekeying
//!
//! The client starts a new key exchange once `rekey_bytes_limit` bytes have
//! crossed the wire or `rekey_time_limit` has elapsed. A KEXINIT from the peer
//! is answered in-line by [`Transport::recv`]. Connection messages that
//! arrive while keys are being replaced are queued and returned afterwards,
//! in order.

use super::error::ConnectionError;
use super::hostkey::PublicKey;
use super::kex::{
    self, EcdhInit, EcdhReply, ExchangeHashInput, KexInit, NegotiatedAlgorithms, SessionKeys,
};
use super::message::{self, disconnect, MessageType};
use super::packet::{open_packet, seal_packet, PacketError, MAX_PACKET_SIZE};
use super::version::{scan_identification, Version};
use super::wire::{Reader, SshBufMut};
use bytes::{BufMut, BytesMut};
use ferrule_platform::{CryptoProvider, HostKeySigner, PacketCipher};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Byte stream an SSH transport can run over.
pub trait SshStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SshStream for T {}

/// Which end of the handshake this transport plays.
#[derive(Clone)]
pub enum Role {
    /// Verifies the server's host key signature.
    Client,
    /// Signs exchange hashes with the given host key.
    Server(Arc<dyn HostKeySigner>),
}

impl Role {
    fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("Client"),
            Role::Server(signer) => write!(f, "Server({})", signer.algorithm()),
        }
    }
}

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification lines are being exchanged.
    VersionExchange,
    /// KEXINIT sent, waiting for the peer's.
    KexInit,
    /// ECDH in progress.
    KeyExchange,
    /// Keys derived, NEWKEYS in flight.
    NewKeys,
    /// Normal operating state.
    Encrypted,
    /// Poisoned or shut down.
    Failed,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification line.
    pub version: Version,

    /// Bytes (both directions) before the client rekeys (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Time before the client rekeys (default: 1 hour).
    pub rekey_time_limit: Duration,

    /// Largest `packet_length` accepted from the peer.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_ferrule(),
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: Duration::from_secs(3600),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Encrypted SSH transport over one byte stream.
pub struct Transport {
    stream: Box<dyn SshStream>,
    provider: Arc<dyn CryptoProvider>,
    config: TransportConfig,
    role: Role,
    state: State,

    peer_version: Option<Version>,
    inbound: BytesMut,

    send_cipher: Option<Box<dyn PacketCipher>>,
    recv_cipher: Option<Box<dyn PacketCipher>>,
    send_sequence: u32,
    recv_sequence: u32,

    session_id: Option<Vec<u8>>,
    host_key: Option<PublicKey>,
    negotiated: Option<NegotiatedAlgorithms>,

    /// Connection messages received during a rekey.
    pending: VecDeque<Vec<u8>>,
    bytes_since_kex: u64,
    last_kex: Instant,
    kex_count: u32,
    poisoned: Option<ConnectionError>,
}

impl Transport {
    /// Runs the client handshake: version exchange, key exchange and host
    /// key signature check.
    ///
    /// The returned transport is Encrypted. The server's host key is
    /// available from [`host_key`](Self::host_key) and has not yet been
    /// checked against any trust store.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] on socket failure, an invalid
    /// identification line, negotiation failure or a bad host key signature.
    pub async fn client<S: SshStream + 'static>(
        stream: S,
        config: TransportConfig,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self, ConnectionError> {
        Self::handshake(Box::new(stream), config, provider, Role::Client).await
    }

    /// Runs the server handshake, signing with `signer`.
    pub async fn server<S: SshStream + 'static>(
        stream: S,
        config: TransportConfig,
        provider: Arc<dyn CryptoProvider>,
        signer: Arc<dyn HostKeySigner>,
    ) -> Result<Self, ConnectionError> {
        Self::handshake(Box::new(stream), config, provider, Role::Server(signer)).await
    }

    async fn handshake(
        stream: Box<dyn SshStream>,
        config: TransportConfig,
        provider: Arc<dyn CryptoProvider>,
        role: Role,
    ) -> Result<Self, ConnectionError> {
        let mut transport = Self {
            stream,
            provider,
            config,
            role,
            state: State::VersionExchange,
            peer_version: None,
            inbound: BytesMut::with_capacity(8192),
            send_cipher: None,
            recv_cipher: None,
            send_sequence: 0,
            recv_sequence: 0,
            session_id: None,
            host_key: None,
            negotiated: None,
            pending: VecDeque::new(),
            bytes_since_kex: 0,
            last_kex: Instant::now(),
            kex_count: 0,
            poisoned: None,
        };

        transport.exchange_versions().await?;
        transport.run_kex(None).await?;
        Ok(transport)
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Our identification.
    pub fn local_version(&self) -> &Version {
        &self.config.version
    }

    /// Peer identification.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Server host key presented during key exchange.
    pub fn host_key(&self) -> Option<&PublicKey> {
        self.host_key.as_ref()
    }

    /// Algorithms of the latest key exchange.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Number of completed key exchanges.
    pub fn kex_count(&self) -> u32 {
        self.kex_count
    }

    /// Whether the transport has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Whether the rekey limits have been reached.
    pub fn rekey_due(&self) -> bool {
        self.state == State::Encrypted
            && (self.bytes_since_kex >= self.config.rekey_bytes_limit
                || self.last_kex.elapsed() >= self.config.rekey_time_limit)
    }

    /// Sends one message payload.
    ///
    /// A client whose rekey limits are reached rekeys first.
    ///
    /// # Errors
    ///
    /// Fails on a poisoned transport or socket error.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.role.is_client() && self.rekey_due() {
            debug!("Rekey limit reached before send");
            self.rekey().await?;
        }
        self.write_packet(payload).await
    }

    /// Receives the next message payload for the layers above.
    ///
    /// IGNORE, DEBUG and UNIMPLEMENTED are consumed here. A peer KEXINIT is
    /// answered in-line. A peer DISCONNECT fails with
    /// [`ConnectionError::Disconnected`] and poisons the transport.
    pub async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(payload) = self.pending.pop_front() {
                return Ok(payload);
            }
            if self.role.is_client() && self.rekey_due() {
                debug!("Rekey limit reached before receive");
                self.rekey().await?;
                continue;
            }

            let payload = self.next_payload().await?;
            if payload[0] == MessageType::KexInit as u8 {
                debug!("Peer initiated key re-exchange");
                self.run_kex(Some(payload)).await?;
                continue;
            }
            return Ok(payload);
        }
    }

    /// Starts a key re-exchange now.
    pub async fn rekey(&mut self) -> Result<(), ConnectionError> {
        self.run_kex(None).await
    }

    /// Sends SSH_MSG_IGNORE, used as a keepalive.
    pub async fn send_ignore(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut payload = Vec::with_capacity(5 + data.len());
        payload.put_u8(MessageType::Ignore as u8);
        payload.put_ssh_string(data);
        self.write_packet(&payload).await
    }

    /// Sends SSH_MSG_DISCONNECT if the transport is still healthy, then shuts
    /// the stream down. Later calls fail with [`ConnectionError::Closed`].
    pub async fn disconnect(&mut self, reason: u32, description: &str) {
        if self.poisoned.is_none() {
            let mut payload = Vec::with_capacity(13 + description.len());
            payload.put_u8(MessageType::Disconnect as u8);
            payload.put_u32(reason);
            payload.put_ssh_string(description.as_bytes());
            payload.put_ssh_string(b"");
            if let Err(e) = self.write_packet(&payload).await {
                debug!("Failed to send disconnect: {}", e);
            }
        }
        self.shutdown().await;
    }

    /// Shuts the stream down without notifying the peer.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Stream shutdown failed: {}", e);
        }
        if self.poisoned.is_none() {
            self.poisoned = Some(ConnectionError::Closed);
        }
        self.state = State::Failed;
    }

    fn transition(&mut self, next: State) -> Result<(), ConnectionError> {
        let valid = matches!(
            (self.state, next),
            (State::VersionExchange, State::KexInit)
                | (State::KexInit, State::KeyExchange)
                | (State::KeyExchange, State::NewKeys)
                | (State::NewKeys, State::Encrypted)
                | (State::Encrypted, State::KexInit)
                | (_, State::Failed)
        );
        if !valid {
            return Err(ConnectionError::Protocol(format!(
                "invalid transport transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn poison(&mut self, err: ConnectionError) -> ConnectionError {
        if self.poisoned.is_none() {
            self.poisoned = Some(err.replay());
        }
        self.state = State::Failed;
        err
    }

    fn check_poisoned(&self) -> Result<(), ConnectionError> {
        match &self.poisoned {
            Some(err) => Err(err.replay()),
            None => Ok(()),
        }
    }

    async fn fill(&mut self) -> Result<(), ConnectionError> {
        self.inbound.reserve(8192);
        match self.stream.read_buf(&mut self.inbound).await {
            Ok(0) => Err(self.poison(ConnectionError::Closed)),
            Ok(_) => Ok(()),
            Err(e) => Err(self.poison(ConnectionError::Io(e))),
        }
    }

    async fn exchange_versions(&mut self) -> Result<(), ConnectionError> {
        let line = self.config.version.to_wire_format();
        if let Err(e) = self.stream.write_all(&line).await {
            return Err(self.poison(e.into()));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.poison(e.into()));
        }

        let mut skipped = 0;
        let peer = loop {
            match scan_identification(&mut self.inbound, &mut skipped) {
                Ok(Some(version)) => break version,
                Ok(None) => self.fill().await?,
                Err(e) => return Err(self.poison(e.into())),
            }
        };

        debug!(
            "Peer identification: {} (skipped {} banner lines)",
            peer, skipped
        );
        self.peer_version = Some(peer);
        Ok(())
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.check_poisoned()?;

        let record = match seal_packet(payload, self.send_cipher.as_mut(), self.send_sequence) {
            Ok(record) => record,
            Err(e) => return Err(self.poison(e.into())),
        };
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.bytes_since_kex += record.len() as u64;

        if let Err(e) = self.stream.write_all(&record).await {
            return Err(self.poison(e.into()));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.poison(e.into()));
        }
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.check_poisoned()?;

        loop {
            let sequence = self.recv_sequence;
            match open_packet(
                &mut self.inbound,
                self.recv_cipher.as_mut(),
                sequence,
                self.config.max_packet_size,
            ) {
                Ok(Some(payload)) => {
                    self.recv_sequence = sequence.wrapping_add(1);
                    self.bytes_since_kex += payload.len() as u64;
                    if payload.is_empty() {
                        return Err(self.poison(ConnectionError::Protocol(
                            "empty packet payload".to_string(),
                        )));
                    }
                    return Ok(payload);
                }
                Ok(None) => self.fill().await?,
                Err(PacketError::Integrity) => {
                    warn!("Integrity failure on inbound packet {}", sequence);
                    return Err(self.poison(ConnectionError::Integrity { sequence }));
                }
                Err(e) => return Err(self.poison(e.into())),
            }
        }
    }

    /// Reads packets, consuming transport-generic messages.
    async fn next_payload(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            let payload = self.read_packet().await?;
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::Ignore) => continue,
                Some(MessageType::Debug) => {
                    let mut reader = Reader::message(&payload, MessageType::Debug as u8)?;
                    let _always_display = reader.read_bool("always_display")?;
                    let text = String::from_utf8_lossy(reader.read_string("message")?);
                    debug!("Peer debug message: {}", text);
                }
                Some(MessageType::Unimplemented) => {
                    let mut reader = Reader::message(&payload, MessageType::Unimplemented as u8)?;
                    warn!(
                        "Peer did not implement our packet {}",
                        reader.read_u32("sequence")?
                    );
                }
                Some(MessageType::Disconnect) => {
                    let mut reader = Reader::message(&payload, MessageType::Disconnect as u8)?;
                    let reason = reader.read_u32("reason code")?;
                    let description =
                        String::from_utf8_lossy(reader.read_string("description")?).into_owned();
                    info!(
                        "Peer disconnected: {} ({})",
                        disconnect::reason_name(reason),
                        description
                    );
                    return Err(self.poison(ConnectionError::Disconnected {
                        reason,
                        description,
                    }));
                }
                _ => return Ok(payload),
            }
        }
    }

    /// Waits for one key exchange message, queueing connection messages if
    /// this is a rekey.
    async fn read_kex_message(&mut self, expected: MessageType) -> Result<Vec<u8>, ConnectionError> {
        loop {
            let payload = self.next_payload().await?;
            let kind = payload[0];
            if kind == expected as u8 {
                return Ok(payload);
            }
            if MessageType::is_key_exchange(kind) || self.session_id.is_none() {
                let err = ConnectionError::Protocol(format!(
                    "expected {} during key exchange, got {}",
                    expected,
                    message::describe(kind)
                ));
                return Err(self.poison(err));
            }
            debug!("Queueing {} received during rekey", message::describe(kind));
            self.pending.push_back(payload);
        }
    }

    /// Runs one full key exchange. `peer_kexinit` is set when the peer
    /// started it.
    async fn run_kex(&mut self, peer_kexinit: Option<Vec<u8>>) -> Result<(), ConnectionError> {
        let result = self.kex_steps(peer_kexinit).await;
        if let Err(e) = result {
            return Err(self.poison(e));
        }
        Ok(())
    }

    async fn kex_steps(&mut self, peer_kexinit: Option<Vec<u8>>) -> Result<(), ConnectionError> {
        self.transition(State::KexInit)?;

        let provider = Arc::clone(&self.provider);
        let ours = KexInit::from_provider(provider.as_ref()).to_bytes();
        self.write_packet(&ours).await?;

        let theirs = match peer_kexinit {
            Some(payload) => payload,
            None => self.read_kex_message(MessageType::KexInit).await?,
        };

        let (client_kexinit, server_kexinit) = if self.role.is_client() {
            (&ours, &theirs)
        } else {
            (&theirs, &ours)
        };
        let client = KexInit::from_bytes(client_kexinit)?;
        let server = KexInit::from_bytes(server_kexinit)?;
        let negotiated = kex::negotiate(provider.as_ref(), &client, &server)?;
        debug!(
            "Negotiated kex={} host_key={} cipher_c2s={} cipher_s2c={}",
            negotiated.kex,
            negotiated.host_key,
            negotiated.cipher_client_to_server,
            negotiated.cipher_server_to_client
        );

        let peer = if self.role.is_client() { &server } else { &client };
        let wrong_guess = peer.first_kex_packet_follows()
            && (peer.kex_algorithms().first() != Some(&negotiated.kex)
                || peer.server_host_key_algorithms().first() != Some(&negotiated.host_key));

        self.transition(State::KeyExchange)?;
        let hash = provider.kex_hash(&negotiated.kex)?;
        let (client_version, server_version) = self.versions();

        let (shared_secret, exchange_hash, host_key) = match self.role.clone() {
            Role::Client => {
                let agreement = provider.start_kex(&negotiated.kex)?;
                let client_ephemeral = agreement.public_key().to_vec();
                self.write_packet(
                    &EcdhInit {
                        client_ephemeral: client_ephemeral.clone(),
                    }
                    .to_bytes(),
                )
                .await?;

                let reply =
                    EcdhReply::from_bytes(&self.read_kex_message(MessageType::KexEcdhReply).await?)?;
                let host_key = PublicKey::from_blob(&reply.host_key)?;
                if host_key.algorithm() != negotiated.host_key {
                    return Err(ConnectionError::Protocol(format!(
                        "server sent a {} host key after negotiating {}",
                        host_key.algorithm(),
                        negotiated.host_key
                    )));
                }

                let shared_secret = Zeroizing::new(agreement.agree(&reply.server_ephemeral)?);
                let exchange_hash = ExchangeHashInput {
                    client_version: &client_version,
                    server_version: &server_version,
                    client_kexinit,
                    server_kexinit,
                    host_key: &reply.host_key,
                    client_ephemeral: &client_ephemeral,
                    server_ephemeral: &reply.server_ephemeral,
                    shared_secret: &shared_secret,
                }
                .compute(provider.as_ref(), hash);

                let valid = provider.verify(
                    &negotiated.host_key,
                    &reply.host_key,
                    &exchange_hash,
                    &reply.signature,
                )?;
                if !valid {
                    warn!("Host key signature did not verify");
                    return Err(ConnectionError::HostKeySignature);
                }
                (shared_secret, exchange_hash, host_key)
            }
            Role::Server(signer) => {
                if wrong_guess {
                    debug!("Discarding wrongly guessed key exchange packet");
                    self.read_kex_message(MessageType::KexEcdhInit).await?;
                }
                let init =
                    EcdhInit::from_bytes(&self.read_kex_message(MessageType::KexEcdhInit).await?)?;
                let agreement = provider.start_kex(&negotiated.kex)?;
                let server_ephemeral = agreement.public_key().to_vec();
                let shared_secret = Zeroizing::new(agreement.agree(&init.client_ephemeral)?);
                let host_key_blob = signer.public_key_blob();

                let exchange_hash = ExchangeHashInput {
                    client_version: &client_version,
                    server_version: &server_version,
                    client_kexinit,
                    server_kexinit,
                    host_key: &host_key_blob,
                    client_ephemeral: &init.client_ephemeral,
                    server_ephemeral: &server_ephemeral,
                    shared_secret: &shared_secret,
                }
                .compute(provider.as_ref(), hash);

                let signature = signer.sign(&exchange_hash)?;
                self.write_packet(
                    &EcdhReply {
                        host_key: host_key_blob.clone(),
                        server_ephemeral,
                        signature,
                    }
                    .to_bytes(),
                )
                .await?;
                (shared_secret, exchange_hash, PublicKey::from_blob(&host_key_blob)?)
            }
        };

        if let Some(previous) = &self.host_key {
            if *previous != host_key {
                return Err(ConnectionError::Protocol(
                    "host key changed during key re-exchange".to_string(),
                ));
            }
        }

        self.transition(State::NewKeys)?;
        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();
        let keys = SessionKeys::derive(
            provider.as_ref(),
            &negotiated,
            &shared_secret,
            &exchange_hash,
            &session_id,
        )?;

        let (send_alg, send_key, send_iv, recv_alg, recv_key, recv_iv) = if self.role.is_client() {
            (
                &negotiated.cipher_client_to_server,
                &keys.key_client_to_server,
                &keys.iv_client_to_server,
                &negotiated.cipher_server_to_client,
                &keys.key_server_to_client,
                &keys.iv_server_to_client,
            )
        } else {
            (
                &negotiated.cipher_server_to_client,
                &keys.key_server_to_client,
                &keys.iv_server_to_client,
                &negotiated.cipher_client_to_server,
                &keys.key_client_to_server,
                &keys.iv_client_to_server,
            )
        };
        let send_cipher = provider.cipher(send_alg, send_key, send_iv)?;
        let recv_cipher = provider.cipher(recv_alg, recv_key, recv_iv)?;

        self.write_packet(&kex::new_keys()).await?;
        self.send_cipher = Some(send_cipher);

        self.read_kex_message(MessageType::NewKeys).await?;
        self.recv_cipher = Some(recv_cipher);

        self.transition(State::Encrypted)?;
        self.host_key = Some(host_key);
        self.negotiated = Some(negotiated);
        self.bytes_since_kex = 0;
        self.last_kex = Instant::now();
        self.kex_count += 1;

        info!("Key exchange {} complete", self.kex_count);
        Ok(())
    }

    /// `(V_C, V_S)` as exchanged, without CR LF.
    fn versions(&self) -> (String, String) {
        let ours = self.config.version.as_exchanged().to_string();
        let theirs = self
            .peer_version
            .as_ref()
            .map(|v| v.as_exchanged().to_string())
            .unwrap_or_default();
        if self.role.is_client() {
            (ours, theirs)
        } else {
            (theirs, ours)
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer_version", &self.peer_version)
            .field("negotiated", &self.negotiated)
            .field("send_sequence", &self.send_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .field("kex_count", &self.kex_count)
            .finish_non_exhaustive()
    }
}
