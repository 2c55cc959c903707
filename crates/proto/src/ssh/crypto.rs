//! Default [`CryptoProvider`] backed by `ring`, `ed25519-dalek` and the
//! RustCrypto hashes.
//!
//! Supported algorithms:
//! - Key exchange: `curve25519-sha256`, `curve25519-sha256@libssh.org`
//! - Host keys: `ssh-ed25519`
//! - Ciphers: `aes256-gcm@openssh.com`, `aes128-gcm@openssh.com`
//!
//! # AES-GCM record layout (RFC 5647)
//!
//! ```text
//! uint32    packet_length        (clear, authenticated as AAD)
//! byte[n]   encrypted body       (padding_length || payload || padding)
//! byte[16]  tag
//! ```
//!
//! The 12-byte nonce is `fixed(4) || invocation_counter(8)`, both taken from
//! the derived IV. The counter increments once per record.

use super::hostkey::{Ed25519HostKey, SSH_ED25519};
use ferrule_platform::{
    CryptoError, CryptoProvider, CryptoResult, HashAlgorithm, KeyAgreement, PacketCipher,
};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const CURVE25519_SHA256: &str = "curve25519-sha256";
const CURVE25519_SHA256_LIBSSH: &str = "curve25519-sha256@libssh.org";
const AES256_GCM: &str = "aes256-gcm@openssh.com";
const AES128_GCM: &str = "aes128-gcm@openssh.com";

/// AES-GCM tag length.
const GCM_TAG_LEN: usize = 16;
/// AES-GCM IV length (fixed field plus invocation counter).
const GCM_IV_LEN: usize = 12;

/// Provider used when the caller does not inject one.
#[derive(Debug, Clone, Default)]
pub struct RingCryptoProvider {
    _private: (),
}

impl RingCryptoProvider {
    /// Creates the provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoProvider for RingCryptoProvider {
    fn kex_algorithms(&self) -> Vec<String> {
        vec![
            CURVE25519_SHA256.to_string(),
            CURVE25519_SHA256_LIBSSH.to_string(),
        ]
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        vec![SSH_ED25519.to_string()]
    }

    fn cipher_algorithms(&self) -> Vec<String> {
        vec![AES256_GCM.to_string(), AES128_GCM.to_string()]
    }

    fn mac_algorithms(&self) -> Vec<String> {
        // Advertised for peers that reject an empty list; GCM never uses it.
        vec!["hmac-sha2-256".to_string()]
    }

    fn start_kex(&self, algorithm: &str) -> CryptoResult<Box<dyn KeyAgreement>> {
        match algorithm {
            CURVE25519_SHA256 | CURVE25519_SHA256_LIBSSH => {
                Ok(Box::new(Curve25519Agreement::new()?))
            }
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn kex_hash(&self, algorithm: &str) -> CryptoResult<HashAlgorithm> {
        match algorithm {
            CURVE25519_SHA256 | CURVE25519_SHA256_LIBSSH => Ok(HashAlgorithm::Sha256),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn cipher_key_sizes(&self, algorithm: &str) -> CryptoResult<(usize, usize)> {
        match algorithm {
            AES256_GCM => Ok((32, GCM_IV_LEN)),
            AES128_GCM => Ok((16, GCM_IV_LEN)),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn cipher(&self, algorithm: &str, key: &[u8], iv: &[u8]) -> CryptoResult<Box<dyn PacketCipher>> {
        Ok(Box::new(AesGcmCipher::new(algorithm, key, iv)?))
    }

    fn verify(
        &self,
        algorithm: &str,
        public_key_blob: &[u8],
        data: &[u8],
        signature_blob: &[u8],
    ) -> CryptoResult<bool> {
        match algorithm {
            SSH_ED25519 => Ed25519HostKey::verify(public_key_blob, data, signature_blob),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn hash(&self, algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
        match algorithm {
            HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// X25519 ephemeral key agreement (RFC 8731).
pub struct Curve25519Agreement {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Agreement {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> CryptoResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| CryptoError::Rng)?;
        let public = private_key
            .compute_public_key()
            .map_err(|_| CryptoError::Primitive("X25519 public key".to_string()))?;

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(public.as_ref());

        Ok(Self {
            private_key,
            public_key,
        })
    }
}

impl KeyAgreement for Curve25519Agreement {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn agree(self: Box<Self>, peer_public: &[u8]) -> CryptoResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(CryptoError::KeyAgreement);
        }
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        let secret = agree_ephemeral(self.private_key, &peer, |material| material.to_vec())
            .map_err(|_| CryptoError::KeyAgreement)?;

        // RFC 8731 Section 3: reject the all-zero shared secret.
        if secret.iter().all(|b| *b == 0) {
            return Err(CryptoError::KeyAgreement);
        }
        Ok(secret)
    }
}

/// RFC 5647 nonce: fixed field plus a 64-bit invocation counter.
struct InvocationCounter {
    fixed: [u8; 4],
    counter: u64,
}

impl InvocationCounter {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..GCM_IV_LEN]);
        Self {
            fixed,
            counter: u64::from_be_bytes(counter),
        }
    }
}

impl NonceSequence for InvocationCounter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce = [0u8; GCM_IV_LEN];
        nonce[..4].copy_from_slice(&self.fixed);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

/// `aes{128,256}-gcm@openssh.com` packet cipher.
///
/// One instance serves one direction; the transport uses either `seal` or
/// `open`, never both.
pub struct AesGcmCipher {
    name: &'static str,
    sealing: SealingKey<InvocationCounter>,
    opening: OpeningKey<InvocationCounter>,
}

impl AesGcmCipher {
    /// Creates the cipher from derived key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] for other names and
    /// [`CryptoError::InvalidKey`] for wrong key or IV sizes.
    pub fn new(algorithm: &str, key: &[u8], iv: &[u8]) -> CryptoResult<Self> {
        let (name, aead, key_len) = match algorithm {
            AES256_GCM => (AES256_GCM, &AES_256_GCM, 32),
            AES128_GCM => (AES128_GCM, &AES_128_GCM, 16),
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        };
        if key.len() != key_len {
            return Err(CryptoError::InvalidKey(format!(
                "{} needs a {}-byte key, got {}",
                name,
                key_len,
                key.len()
            )));
        }
        if iv.len() != GCM_IV_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "{} needs a {}-byte IV, got {}",
                name,
                GCM_IV_LEN,
                iv.len()
            )));
        }

        let unbound = |key: &[u8]| {
            UnboundKey::new(aead, key).map_err(|_| CryptoError::InvalidKey(name.to_string()))
        };
        Ok(Self {
            name,
            sealing: SealingKey::new(unbound(key)?, InvocationCounter::new(iv)),
            opening: OpeningKey::new(unbound(key)?, InvocationCounter::new(iv)),
        })
    }
}

fn length_aad(record: &[u8]) -> CryptoResult<[u8; 4]> {
    record
        .get(..4)
        .and_then(|len| len.try_into().ok())
        .ok_or_else(|| CryptoError::Malformed("record shorter than its length field".to_string()))
}

impl PacketCipher for AesGcmCipher {
    fn name(&self) -> &str {
        self.name
    }

    fn block_size(&self) -> usize {
        16
    }

    fn tag_len(&self) -> usize {
        GCM_TAG_LEN
    }

    fn seal(&mut self, _sequence: u32, record: &mut Vec<u8>) -> CryptoResult<()> {
        let aad = length_aad(record)?;
        let tag = self
            .sealing
            .seal_in_place_separate_tag(Aad::from(aad), &mut record[4..])
            .map_err(|_| CryptoError::Primitive(format!("{} seal", self.name)))?;
        record.extend_from_slice(tag.as_ref());
        Ok(())
    }

    fn open(&mut self, _sequence: u32, record: &mut Vec<u8>) -> CryptoResult<()> {
        let aad = length_aad(record)?;
        if record.len() < 4 + GCM_TAG_LEN {
            return Err(CryptoError::Integrity);
        }
        let plaintext_len = self
            .opening
            .open_in_place(Aad::from(aad), &mut record[4..])
            .map_err(|_| CryptoError::Integrity)?
            .len();
        record.truncate(4 + plaintext_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(body: &[u8]) -> Vec<u8> {
        let mut record = (body.len() as u32).to_be_bytes().to_vec();
        record.extend_from_slice(body);
        record
    }

    #[test]
    fn test_curve25519_agreement() {
        let provider = RingCryptoProvider::new();
        let client = provider.start_kex("curve25519-sha256").unwrap();
        let server = provider.start_kex("curve25519-sha256@libssh.org").unwrap();
        let client_public = client.public_key().to_vec();
        let server_public = server.public_key().to_vec();
        assert_eq!(client_public.len(), 32);

        let client_secret = client.agree(&server_public).unwrap();
        let server_secret = server.agree(&client_public).unwrap();
        assert_eq!(client_secret, server_secret);
    }

    #[test]
    fn test_curve25519_rejects_bad_peer() {
        let agreement = Box::new(Curve25519Agreement::new().unwrap());
        assert!(matches!(
            agreement.agree(&[0u8; 31]),
            Err(CryptoError::KeyAgreement)
        ));

        // Low-order point yields the all-zero secret.
        let agreement = Box::new(Curve25519Agreement::new().unwrap());
        assert!(agreement.agree(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_gcm_seal_open() {
        let key = [7u8; 32];
        let iv = [9u8; 12];
        let mut sender = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();
        let mut receiver = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();

        for n in 0..3u32 {
            let original = record(&[n as u8; 32]);
            let mut sealed = original.clone();
            sender.seal(n, &mut sealed).unwrap();
            assert_eq!(sealed.len(), original.len() + GCM_TAG_LEN);
            assert_eq!(&sealed[..4], &original[..4]);
            assert_ne!(&sealed[4..36], &original[4..]);

            receiver.open(n, &mut sealed).unwrap();
            assert_eq!(sealed, original);
        }
    }

    #[test]
    fn test_gcm_detects_tampering() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let mut sender = AesGcmCipher::new(AES128_GCM, &key, &iv).unwrap();
        let mut receiver = AesGcmCipher::new(AES128_GCM, &key, &iv).unwrap();

        let mut sealed = record(&[0u8; 16]);
        sender.seal(0, &mut sealed).unwrap();
        sealed[6] ^= 0x01;
        assert!(matches!(
            receiver.open(0, &mut sealed),
            Err(CryptoError::Integrity)
        ));
    }

    #[test]
    fn test_gcm_length_is_authenticated() {
        let key = [1u8; 32];
        let iv = [2u8; 12];
        let mut sender = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();
        let mut receiver = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();

        let mut sealed = record(&[0u8; 16]);
        sender.seal(0, &mut sealed).unwrap();
        sealed[3] ^= 0x10;
        assert!(receiver.open(0, &mut sealed).is_err());
    }

    #[test]
    fn test_gcm_counter_out_of_step_fails() {
        let key = [3u8; 32];
        let iv = [4u8; 12];
        let mut sender = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();
        let mut receiver = AesGcmCipher::new(AES256_GCM, &key, &iv).unwrap();

        let mut first = record(&[0u8; 16]);
        sender.seal(0, &mut first).unwrap();
        let mut second = record(&[0u8; 16]);
        sender.seal(1, &mut second).unwrap();

        // Replaying the second record as the first must not verify.
        assert!(receiver.open(0, &mut second).is_err());
    }

    #[test]
    fn test_cipher_rejects_wrong_sizes() {
        assert!(matches!(
            AesGcmCipher::new(AES256_GCM, &[0u8; 16], &[0u8; 12]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            AesGcmCipher::new("3des-cbc", &[0u8; 24], &[0u8; 8]),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_hash_lengths() {
        let provider = RingCryptoProvider::new();
        assert_eq!(provider.hash(HashAlgorithm::Sha256, b"abc").len(), 32);
        assert_eq!(provider.hash(HashAlgorithm::Sha1, b"abc").len(), 20);
    }
}
