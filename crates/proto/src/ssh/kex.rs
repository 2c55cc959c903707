//! SSH key exchange (RFC 4253 Section 7, RFC 8731).
//!
//! This module holds the key exchange messages and the pure computations
//! around them:
//! - SSH_MSG_KEXINIT and algorithm negotiation
//! - SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEX_ECDH_REPLY
//! - The exchange hash `H`
//! - Session key derivation
//!
//! The message flow itself is driven by
//! [`Transport`](super::transport::Transport).
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server offers)
//! 3. ECDH: client sends Q_C, server answers with K_S, Q_S and a signature over H
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys after its NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::crypto::RingCryptoProvider;
//! use ferrule_proto::ssh::kex::KexInit;
//!
//! let kexinit = KexInit::from_provider(&RingCryptoProvider::new());
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20); // SSH_MSG_KEXINIT
//! assert_eq!(KexInit::from_bytes(&bytes).unwrap(), kexinit);
//! ```

use super::error::ConnectionError;
use super::message::MessageType;
use super::wire::{Reader, SshBufMut, WireError};
use bytes::BufMut;
use ferrule_platform::{CryptoProvider, HashAlgorithm};
use rand::RngCore;
use zeroize::Zeroizing;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Every list is ordered by preference, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT advertising everything `provider` supports.
    ///
    /// Compression is always `none`; language lists are empty.
    pub fn from_provider(provider: &dyn CryptoProvider) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = provider.cipher_algorithms();
        let macs = provider.mac_algorithms();

        Self {
            cookie,
            kex_algorithms: provider.kex_algorithms(),
            server_host_key_algorithms: provider.host_key_algorithms(),
            encryption_client_to_server: ciphers.clone(),
            encryption_server_to_client: ciphers,
            mac_client_to_server: macs.clone(),
            mac_server_to_client: macs,
            compression_client_to_server: vec!["none".to_string()],
            compression_server_to_client: vec!["none".to_string()],
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client to server ciphers.
    pub fn encryption_client_to_server(&self) -> &[String] {
        &self.encryption_client_to_server
    }

    /// Returns the server to client ciphers.
    pub fn encryption_server_to_client(&self) -> &[String] {
        &self.encryption_server_to_client
    }

    /// Returns whether a guessed KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message, type byte included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_client_to_server);
        buf.put_name_list(&self.encryption_server_to_client);
        buf.put_name_list(&self.mac_client_to_server);
        buf.put_name_list(&self.mac_server_to_client);
        buf.put_name_list(&self.compression_client_to_server);
        buf.put_name_list(&self.compression_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);

        buf.put_ssh_bool(self.first_kex_packet_follows);
        // reserved
        buf.put_u32(0);

        buf
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on a wrong type byte or truncated field.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::KexInit as u8)?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(reader.read_raw(16, "cookie")?);

        let kexinit = Self {
            cookie,
            kex_algorithms: reader.read_name_list("kex_algorithms")?,
            server_host_key_algorithms: reader.read_name_list("server_host_key_algorithms")?,
            encryption_client_to_server: reader.read_name_list("encryption_client_to_server")?,
            encryption_server_to_client: reader.read_name_list("encryption_server_to_client")?,
            mac_client_to_server: reader.read_name_list("mac_client_to_server")?,
            mac_server_to_client: reader.read_name_list("mac_server_to_client")?,
            compression_client_to_server: reader
                .read_name_list("compression_client_to_server")?,
            compression_server_to_client: reader
                .read_name_list("compression_server_to_client")?,
            languages_client_to_server: reader.read_name_list("languages_client_to_server")?,
            languages_server_to_client: reader.read_name_list("languages_server_to_client")?,
            first_kex_packet_follows: reader.read_bool("first_kex_packet_follows")?,
        };
        reader.read_u32("reserved")?;

        Ok(kexinit)
    }
}

/// Algorithms chosen for one key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Server host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: String,
    /// Cipher server to client
    pub cipher_server_to_client: String,
    /// MAC client to server; `None` when the cipher authenticates itself
    pub mac_client_to_server: Option<String>,
    /// MAC server to client; `None` when the cipher authenticates itself
    pub mac_server_to_client: Option<String>,
    /// Compression (always `none`)
    pub compression: String,
}

/// Negotiates every category of two KEXINIT messages.
///
/// Each category picks the first client entry that the server also lists.
/// MAC lists are informational for AEAD ciphers, so a disjoint MAC list is
/// not an error.
///
/// # Errors
///
/// Returns [`ConnectionError::Negotiation`] naming the first category with
/// no common algorithm.
pub fn negotiate(
    provider: &dyn CryptoProvider,
    client: &KexInit,
    server: &KexInit,
) -> Result<NegotiatedAlgorithms, ConnectionError> {
    let pick = |category: &'static str, c: &[String], s: &[String]| {
        provider
            .negotiate(c, s)
            .map_err(|source| ConnectionError::Negotiation { category, source })
    };

    let negotiated = NegotiatedAlgorithms {
        kex: pick("kex", &client.kex_algorithms, &server.kex_algorithms)?,
        host_key: pick(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        cipher_client_to_server: pick(
            "cipher (client to server)",
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
        )?,
        cipher_server_to_client: pick(
            "cipher (server to client)",
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
        )?,
        mac_client_to_server: provider
            .negotiate(&client.mac_client_to_server, &server.mac_client_to_server)
            .ok(),
        mac_server_to_client: provider
            .negotiate(&client.mac_server_to_client, &server.mac_server_to_client)
            .ok(),
        compression: pick(
            "compression",
            &client.compression_client_to_server,
            &server.compression_client_to_server,
        )?,
    };
    pick(
        "compression",
        &client.compression_server_to_client,
        &server.compression_server_to_client,
    )?;

    Ok(negotiated)
}

/// SSH_MSG_KEX_ECDH_INIT: the client's ephemeral public key `Q_C`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhInit {
    /// Client ephemeral public key
    pub client_ephemeral: Vec<u8>,
}

impl EcdhInit {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.client_ephemeral.len());
        buf.put_u8(MessageType::KexEcdhInit as u8);
        buf.put_ssh_string(&self.client_ephemeral);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::KexEcdhInit as u8)?;
        Ok(Self {
            client_ephemeral: reader.read_string("Q_C")?.to_vec(),
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY: host key `K_S`, server ephemeral `Q_S` and the
/// signature over the exchange hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhReply {
    /// Server public host key blob
    pub host_key: Vec<u8>,
    /// Server ephemeral public key
    pub server_ephemeral: Vec<u8>,
    /// Signature blob over `H`
    pub signature: Vec<u8>,
}

impl EcdhReply {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(MessageType::KexEcdhReply as u8);
        buf.put_ssh_string(&self.host_key);
        buf.put_ssh_string(&self.server_ephemeral);
        buf.put_ssh_string(&self.signature);
        buf
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::message(data, MessageType::KexEcdhReply as u8)?;
        Ok(Self {
            host_key: reader.read_string("K_S")?.to_vec(),
            server_ephemeral: reader.read_string("Q_S")?.to_vec(),
            signature: reader.read_string("signature")?.to_vec(),
        })
    }
}

/// SSH_MSG_NEWKEYS payload.
pub fn new_keys() -> Vec<u8> {
    vec![MessageType::NewKeys as u8]
}

/// Inputs of the exchange hash (RFC 4253 Section 8, RFC 5656 Section 4).
#[derive(Debug)]
pub struct ExchangeHashInput<'a> {
    /// V_C: client identification, without CR LF
    pub client_version: &'a str,
    /// V_S: server identification, without CR LF
    pub server_version: &'a str,
    /// I_C: payload of the client's KEXINIT
    pub client_kexinit: &'a [u8],
    /// I_S: payload of the server's KEXINIT
    pub server_kexinit: &'a [u8],
    /// K_S: server host key blob
    pub host_key: &'a [u8],
    /// Q_C: client ephemeral public key
    pub client_ephemeral: &'a [u8],
    /// Q_S: server ephemeral public key
    pub server_ephemeral: &'a [u8],
    /// K: shared secret
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// Computes `H = HASH(V_C || V_S || I_C || I_S || K_S || Q_C || Q_S || K)`.
    pub fn compute(&self, provider: &dyn CryptoProvider, hash: HashAlgorithm) -> Vec<u8> {
        let mut buf = Zeroizing::new(Vec::with_capacity(1024));
        buf.put_ssh_string(self.client_version.as_bytes());
        buf.put_ssh_string(self.server_version.as_bytes());
        buf.put_ssh_string(self.client_kexinit);
        buf.put_ssh_string(self.server_kexinit);
        buf.put_ssh_string(self.host_key);
        buf.put_ssh_string(self.client_ephemeral);
        buf.put_ssh_string(self.server_ephemeral);
        buf.put_mpint(self.shared_secret);
        provider.hash(hash, &buf)
    }
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || ... truncated to `len`
/// ```
///
/// `K` is encoded as an mpint.
pub fn derive_key(
    provider: &dyn CryptoProvider,
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Zeroizing<Vec<u8>> {
    let mut prefix = Zeroizing::new(Vec::with_capacity(shared_secret.len() + 5 + exchange_hash.len()));
    prefix.put_mpint(shared_secret);
    prefix.put_slice(exchange_hash);

    let mut input = Zeroizing::new(prefix.to_vec());
    input.put_u8(letter);
    input.put_slice(session_id);

    let mut key = Zeroizing::new(provider.hash(hash, &input));
    while key.len() < len {
        let mut input = Zeroizing::new(prefix.to_vec());
        input.put_slice(&key);
        let block = Zeroizing::new(provider.hash(hash, &input));
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}

/// Key material for both directions.
pub struct SessionKeys {
    /// IV client to server (letter A)
    pub iv_client_to_server: Zeroizing<Vec<u8>>,
    /// IV server to client (letter B)
    pub iv_server_to_client: Zeroizing<Vec<u8>>,
    /// Key client to server (letter C)
    pub key_client_to_server: Zeroizing<Vec<u8>>,
    /// Key server to client (letter D)
    pub key_server_to_client: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    /// Derives IVs and keys sized for the negotiated ciphers.
    ///
    /// Integrity keys (letters E and F) are not derived: only AEAD ciphers
    /// are negotiated.
    pub fn derive(
        provider: &dyn CryptoProvider,
        negotiated: &NegotiatedAlgorithms,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
    ) -> Result<Self, ConnectionError> {
        let hash = provider.kex_hash(&negotiated.kex)?;
        let (key_c2s, iv_c2s) = provider.cipher_key_sizes(&negotiated.cipher_client_to_server)?;
        let (key_s2c, iv_s2c) = provider.cipher_key_sizes(&negotiated.cipher_server_to_client)?;

        let derive = |letter: u8, len: usize| {
            derive_key(
                provider,
                hash,
                shared_secret,
                exchange_hash,
                letter,
                session_id,
                len,
            )
        };

        Ok(Self {
            iv_client_to_server: derive(b'A', iv_c2s),
            iv_server_to_client: derive(b'B', iv_s2c),
            key_client_to_server: derive(b'C', key_c2s),
            key_server_to_client: derive(b'D', key_s2c),
        })
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}
