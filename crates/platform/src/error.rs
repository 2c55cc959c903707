//! Error types for cryptographic providers

use thiserror::Error;

/// Failure raised by a [`CryptoProvider`](crate::CryptoProvider) or one of
/// the objects it hands out.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provider does not implement the named algorithm.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The two algorithm lists share no entry.
    #[error("no common algorithm: client offers {client:?}, server offers {server:?}")]
    NoCommonAlgorithm {
        /// Client preference list
        client: Vec<String>,
        /// Server preference list
        server: Vec<String>,
    },

    /// Key material has the wrong size or encoding.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A signature or key blob is malformed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The peer's ephemeral public value was rejected.
    #[error("key agreement failed")]
    KeyAgreement,

    /// An authentication tag did not verify.
    #[error("record authentication failed")]
    Integrity,

    /// The system random source failed.
    #[error("random number generation failed")]
    Rng,

    /// Sealing or signing failed inside the primitive.
    #[error("primitive failure: {0}")]
    Primitive(String),
}

/// Result type for provider operations
pub type CryptoResult<T> = Result<T, CryptoError>;
