use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;
use crate::{PUBLIC_KEY_SIZE, RSA_BITS, SESSION_KEY_SIZE};

/// Ephemeral AES-256 key issued by the server for one connected session.
///
/// Zeroed on drop. `Debug` never prints the bytes.
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; SESSION_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::SessionKeyLength {
                expected: SESSION_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Capability to unwrap the server-issued session key.
///
/// Exactly one production implementation exists: [`RsaOaepCipher`].
pub trait AsymmetricCipher: Send + Sync {
    /// DER-encoded public key sent to the server.
    fn public_key_der(&self) -> &[u8];

    /// Decrypt an encrypted session key blob.
    fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey, CryptoError>;
}

/// The client's RSA keypair.
#[derive(Clone)]
pub struct ClientKeypair {
    private_key: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl ClientKeypair {
    /// Generate a fresh 1024-bit keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_der = RsaPublicKey::from(&private_key)
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?
            .as_bytes()
            .to_vec();
        if public_der.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::KeyEncoding(format!(
                "public key DER is {} bytes, expected {}",
                public_der.len(),
                PUBLIC_KEY_SIZE
            )));
        }
        Ok(Self {
            private_key,
            public_der,
        })
    }

    /// Restore from PKCS#8 DER bytes.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// PKCS#8 DER encoding of the private key.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        let doc = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Base64 of the PKCS#8 DER private key, for the identity file.
    pub fn to_base64(&self) -> Result<String, CryptoError> {
        Ok(BASE64.encode(self.to_pkcs8_der()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let der = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Self::from_pkcs8_der(&der)
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// First 8 bytes of SHA-256 over the public key DER, as hex. Safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.public_der);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for ClientKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeypair")
            .field("fingerprint", &self.fingerprint())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// RSA-OAEP(SHA-256) session key unwrapping with the client's private key.
#[derive(Debug, Clone)]
pub struct RsaOaepCipher {
    keypair: ClientKeypair,
}

impl RsaOaepCipher {
    pub fn new(keypair: ClientKeypair) -> Self {
        Self { keypair }
    }

    pub fn keypair(&self) -> &ClientKeypair {
        &self.keypair
    }
}

impl AsymmetricCipher for RsaOaepCipher {
    fn public_key_der(&self) -> &[u8] {
        self.keypair.public_key_der()
    }

    fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey, CryptoError> {
        let plain = self
            .keypair
            .private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| CryptoError::KeyDecryption(e.to_string()))?;
        SessionKey::from_slice(&plain)
    }
}

/// Encrypt a session key to a DER public key. The server side of the
/// exchange; kept here so tests and tools share one OAEP configuration.
pub fn wrap_session_key(public_der: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let public_key = RsaPublicKey::from_public_key_der(public_der)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}
