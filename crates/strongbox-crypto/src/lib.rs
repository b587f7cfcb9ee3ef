/// Strongbox Crypto Library
///
/// - RSA-1024 client keypair, OAEP(SHA-256) session key transport
/// - AES-256-CBC chunk cipher with the protocol's static zero IV
/// - POSIX `cksum` CRC for end-to-end file verification

pub mod cksum;
pub mod encrypt;
pub mod error;
pub mod keys;

pub use cksum::{Cksum, cksum};
pub use encrypt::{decrypt_chunk, encrypt_chunk, encrypted_len};
pub use error::CryptoError;
pub use keys::{AsymmetricCipher, ClientKeypair, RsaOaepCipher, SessionKey, wrap_session_key};

/// RSA modulus size in bits.
pub const RSA_BITS: usize = 1024;

/// SubjectPublicKeyInfo DER length for a 1024-bit modulus with e = 65537.
pub const PUBLIC_KEY_SIZE: usize = 162;

/// AES-256 key length.
pub const SESSION_KEY_SIZE: usize = 32;

/// AES block size; also the IV length.
pub const AES_BLOCK_SIZE: usize = 16;
