//! Host keys: public key blobs, fingerprints and the Ed25519 signer.
//!
//! Public keys travel in SSH wire encoding (RFC 4253 Section 6.6):
//!
//! ```text
//! string    algorithm name
//! ...       algorithm specific fields
//! ```
//!
//! [`PublicKey`] keeps the algorithm name next to the full blob so that
//! known-hosts entries and fingerprints never depend on parsing the
//! algorithm-specific part.
//!
//! # Example
//!
//! ```rust
//! use ferrule_proto::ssh::hostkey::Ed25519HostKey;
//! use ferrule_platform::HostKeySigner;
//!
//! let key = Ed25519HostKey::generate();
//! let public = key.public_key();
//! assert_eq!(public.algorithm(), "ssh-ed25519");
//! assert!(public.fingerprint().to_string().starts_with("SHA256:"));
//!
//! let signature = key.sign(b"exchange hash").unwrap();
//! assert!(Ed25519HostKey::verify(public.blob(), b"exchange hash", &signature).unwrap());
//! ```

use super::wire::{Reader, SshBufMut, WireError};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use ferrule_platform::{CryptoError, CryptoResult, HostKeySigner};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Algorithm name for Ed25519 host keys.
pub const SSH_ED25519: &str = "ssh-ed25519";

/// Public key in SSH wire encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
}

impl PublicKey {
    /// Wraps a wire-encoded key blob.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the blob does not start with an algorithm
    /// name.
    pub fn from_blob(blob: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(blob);
        let algorithm = reader.read_utf8("key algorithm")?;
        if algorithm.is_empty() {
            return Err(WireError::Invalid {
                field: "key algorithm",
                reason: "empty".to_string(),
            });
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            blob: blob.to_vec(),
        })
    }

    /// Parses `algorithm base64-blob` as found in known-hosts lines and
    /// `.pub` files.
    ///
    /// # Errors
    ///
    /// Fails if the base64 is invalid or the algorithm in the blob disagrees
    /// with the declared one.
    pub fn from_openssh(algorithm: &str, base64_blob: &str) -> Result<Self, WireError> {
        let blob = STANDARD
            .decode(base64_blob)
            .map_err(|e| WireError::Invalid {
                field: "key blob",
                reason: e.to_string(),
            })?;
        let key = Self::from_blob(&blob)?;
        if key.algorithm != algorithm {
            return Err(WireError::Invalid {
                field: "key algorithm",
                reason: format!("declared {} but blob holds {}", algorithm, key.algorithm),
            });
        }
        Ok(key)
    }

    /// Algorithm name (for example `ssh-ed25519`).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Full wire-encoded blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// SHA-256 fingerprint of the blob.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.blob)
    }

    /// `algorithm base64-blob`, as written to known-hosts files.
    pub fn to_openssh(&self) -> String {
        format!("{} {}", self.algorithm, STANDARD.encode(&self.blob))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint())
    }
}

/// Key fingerprint.
///
/// Displays in the OpenSSH format `SHA256:<unpadded base64>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    sha256: [u8; 32],
    sha1: [u8; 20],
}

impl Fingerprint {
    /// Fingerprints a wire-encoded key blob.
    pub fn of(blob: &[u8]) -> Self {
        Self {
            sha256: Sha256::digest(blob).into(),
            sha1: Sha1::digest(blob).into(),
        }
    }

    /// Raw SHA-256 digest.
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    /// Legacy colon-separated SHA-1 hex digest, for display next to older
    /// tooling.
    pub fn sha1_hex(&self) -> String {
        self.sha1
            .iter()
            .map(|byte| hex::encode([*byte]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SHA256:{}", STANDARD_NO_PAD.encode(self.sha256))
    }
}

/// Ed25519 host key (RFC 8709).
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519HostKey {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        let secret = Zeroizing::new(rand::Rng::gen::<[u8; SECRET_KEY_LENGTH]>(
            &mut rand::thread_rng(),
        ));
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Creates a key from its 32-byte secret.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for any other length.
    pub fn from_bytes(secret: &[u8]) -> CryptoResult<Self> {
        let secret: &[u8; SECRET_KEY_LENGTH] = secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Ed25519 secret key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Secret key bytes.
    ///
    /// WARNING: This exposes the private key material. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Public half as a [`PublicKey`].
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            algorithm: SSH_ED25519.to_string(),
            blob: self.public_key_blob(),
        }
    }

    /// Verifies an SSH `ssh-ed25519` signature blob.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not verify.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Malformed`] if either blob is not an
    /// `ssh-ed25519` encoding.
    pub fn verify(public_key_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> CryptoResult<bool> {
        let public_key = read_typed_blob(public_key_blob, "public key", 32)?;
        let signature = read_typed_blob(signature_blob, "signature", 64)?;

        let public_key: &[u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::Malformed("Ed25519 public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("Ed25519 public key: {}", e)))?;

        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::Malformed(format!("Ed25519 signature: {}", e)))?;

        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

/// Reads `string "ssh-ed25519" || string value` and checks the value length.
fn read_typed_blob<'a>(blob: &'a [u8], what: &str, len: usize) -> CryptoResult<&'a [u8]> {
    let mut reader = Reader::new(blob);
    let algorithm = reader
        .read_utf8("algorithm")
        .map_err(|e| CryptoError::Malformed(format!("{}: {}", what, e)))?;
    if algorithm != SSH_ED25519 {
        return Err(CryptoError::Malformed(format!(
            "{} algorithm {} is not {}",
            what, algorithm, SSH_ED25519
        )));
    }
    let value = reader
        .read_string("value")
        .map_err(|e| CryptoError::Malformed(format!("{}: {}", what, e)))?;
    if value.len() != len {
        return Err(CryptoError::Malformed(format!(
            "{} is {} bytes, expected {}",
            what,
            value.len(),
            len
        )));
    }
    Ok(value)
}

impl HostKeySigner for Ed25519HostKey {
    fn algorithm(&self) -> &str {
        SSH_ED25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(51);
        blob.put_ssh_string(SSH_ED25519.as_bytes());
        blob.put_ssh_string(self.verifying_key.as_bytes());
        blob
    }

    fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut blob = Vec::with_capacity(83);
        blob.put_ssh_string(SSH_ED25519.as_bytes());
        blob.put_ssh_string(&signature.to_bytes());
        Ok(blob)
    }
}

impl fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("public_key", &self.public_key().fingerprint().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519HostKey::generate();
        let signature = key.sign(b"test data").unwrap();

        assert!(Ed25519HostKey::verify(&key.public_key_blob(), b"test data", &signature).unwrap());
        assert!(!Ed25519HostKey::verify(&key.public_key_blob(), b"other data", &signature).unwrap());
    }

    #[test]
    fn test_ed25519_from_bytes() {
        let key = Ed25519HostKey::generate();
        let restored = Ed25519HostKey::from_bytes(&key.secret_bytes()[..]).unwrap();
        assert_eq!(key.public_key(), restored.public_key());

        assert!(matches!(
            Ed25519HostKey::from_bytes(&[0u8; 31]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_algorithm() {
        let key = Ed25519HostKey::generate();
        let mut signature = Vec::new();
        signature.put_ssh_string(b"ssh-rsa");
        signature.put_ssh_string(&[0u8; 64]);
        assert!(matches!(
            Ed25519HostKey::verify(&key.public_key_blob(), b"x", &signature),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn test_public_key_openssh_format() {
        let key = Ed25519HostKey::generate().public_key();
        let line = key.to_openssh();
        let (algorithm, blob) = line.split_once(' ').unwrap();
        assert_eq!(algorithm, "ssh-ed25519");
        assert_eq!(PublicKey::from_openssh(algorithm, blob).unwrap(), key);
        assert!(PublicKey::from_openssh("ssh-rsa", blob).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = Fingerprint::of(b"blob");
        let text = fingerprint.to_string();
        assert!(text.starts_with("SHA256:"));
        // 32 bytes of unpadded base64
        assert_eq!(text.len(), "SHA256:".len() + 43);
        assert!(!text.ends_with('='));

        let legacy = fingerprint.sha1_hex();
        assert_eq!(legacy.split(':').count(), 20);
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = Ed25519HostKey::generate();
        let text = format!("{:?}", key);
        assert!(text.contains("SHA256:"));
        assert!(!text.contains("signing_key"));
    }
}
