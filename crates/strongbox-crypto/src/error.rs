use thiserror::Error;

/// Failures in key generation, encoding, encryption or decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("session key decryption failed: {0}")]
    KeyDecryption(String),

    #[error("session key has wrong length: expected {expected}, got {actual}")]
    SessionKeyLength { expected: usize, actual: usize },

    #[error("chunk encryption failed: {0}")]
    Encryption(String),

    #[error("chunk decryption failed: {0}")]
    Decryption(String),
}
