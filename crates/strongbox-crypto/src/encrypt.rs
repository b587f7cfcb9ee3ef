use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::AES_BLOCK_SIZE;
use crate::error::CryptoError;
use crate::keys::SessionKey;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The wire protocol fixes the IV at all zeroes, so identical plaintext under
/// the same session key always produces identical ciphertext. Changing this
/// requires a protocol version bump.
const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

/// Ciphertext length for `plaintext_len` bytes under PKCS#7: always at least
/// one byte of padding, so an exact multiple of 16 gains a full block.
pub fn encrypted_len(plaintext_len: usize) -> usize {
    (plaintext_len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
}

/// Encrypt one chunk with AES-256-CBC, zero IV, PKCS#7 padding.
pub fn encrypt_chunk(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &ZERO_IV)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Inverse of [`encrypt_chunk`].
pub fn decrypt_chunk(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            AES_BLOCK_SIZE
        )));
    }
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &ZERO_IV)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Decryption(e.to_string()))
}
