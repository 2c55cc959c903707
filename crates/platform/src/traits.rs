//! Cryptographic collaborator interfaces
//!
//! The SSH core treats every primitive as a black box behind these traits.
//! A provider names the algorithms it supports in preference order and builds
//! the stateful objects (key agreements, packet ciphers) the transport needs.

use crate::{CryptoError, CryptoResult};

/// Digest algorithms a provider must expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1 (legacy fingerprints and hashed known-hosts names only)
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

/// One ephemeral key agreement (for example X25519).
pub trait KeyAgreement: Send {
    /// Our ephemeral public value, sent to the peer.
    fn public_key(&self) -> &[u8];

    /// Combines our private value with the peer's public value.
    ///
    /// Consumes the agreement so the private value is used exactly once.
    /// Returns the raw shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyAgreement`] if the peer value is invalid.
    fn agree(self: Box<Self>, peer_public: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Authenticated encryption for one direction of a transport.
///
/// Records are laid out as `uint32 length || body || tag`. The length stays in
/// clear and is authenticated as associated data.
pub trait PacketCipher: Send {
    /// Algorithm name as negotiated (for example `aes256-gcm@openssh.com`).
    fn name(&self) -> &str;

    /// Block size that `body` must be aligned to.
    fn block_size(&self) -> usize;

    /// Length of the authentication tag appended to every record.
    fn tag_len(&self) -> usize;

    /// Encrypts `record[4..]` in place and appends the tag.
    ///
    /// `sequence` is the transport sequence number of the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is shorter than its length field or the
    /// primitive fails.
    fn seal(&mut self, sequence: u32, record: &mut Vec<u8>) -> CryptoResult<()>;

    /// Verifies the tag, decrypts `record[4..]` in place and removes the tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Integrity`] if the tag does not verify.
    fn open(&mut self, sequence: u32, record: &mut Vec<u8>) -> CryptoResult<()>;
}

/// Long-term host key able to sign exchange hashes.
pub trait HostKeySigner: Send + Sync {
    /// Public key algorithm name (for example `ssh-ed25519`).
    fn algorithm(&self) -> &str;

    /// Public key in SSH wire encoding.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning an SSH signature blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Primitive`] if signing fails.
    fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Source of every cryptographic primitive used by the SSH core.
pub trait CryptoProvider: Send + Sync {
    /// Key exchange algorithms, most preferred first.
    fn kex_algorithms(&self) -> Vec<String>;

    /// Host key algorithms we can verify, most preferred first.
    fn host_key_algorithms(&self) -> Vec<String>;

    /// Packet ciphers, most preferred first.
    fn cipher_algorithms(&self) -> Vec<String>;

    /// MAC algorithms to advertise. AEAD ciphers carry their own tag, so the
    /// list is informational unless a non-AEAD cipher is negotiated.
    fn mac_algorithms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Picks one algorithm from two preference lists.
    ///
    /// The default follows RFC 4253 Section 7.1: the first client entry that
    /// the server also offers.
    fn negotiate(&self, client: &[String], server: &[String]) -> CryptoResult<String> {
        negotiate_first_match(client, server)
    }

    /// Starts a key agreement for `algorithm`.
    fn start_kex(&self, algorithm: &str) -> CryptoResult<Box<dyn KeyAgreement>>;

    /// Hash function bound to a key exchange algorithm.
    fn kex_hash(&self, algorithm: &str) -> CryptoResult<HashAlgorithm>;

    /// Key and IV lengths for a cipher.
    fn cipher_key_sizes(&self, algorithm: &str) -> CryptoResult<(usize, usize)>;

    /// Builds a packet cipher from derived key material.
    fn cipher(&self, algorithm: &str, key: &[u8], iv: &[u8]) -> CryptoResult<Box<dyn PacketCipher>>;

    /// Verifies an SSH signature blob over `data` with an SSH public key blob.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify.
    fn verify(
        &self,
        algorithm: &str,
        public_key_blob: &[u8],
        data: &[u8],
        signature_blob: &[u8],
    ) -> CryptoResult<bool>;

    /// Hashes `data`.
    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8>;
}

/// Returns the first entry of `client` that also appears in `server`.
///
/// # Errors
///
/// Returns [`CryptoError::NoCommonAlgorithm`] if the lists are disjoint.
pub fn negotiate_first_match(client: &[String], server: &[String]) -> CryptoResult<String> {
    client
        .iter()
        .find(|candidate| server.contains(candidate))
        .cloned()
        .ok_or_else(|| CryptoError::NoCommonAlgorithm {
            client: client.to_vec(),
            server: server.to_vec(),
        })
}
