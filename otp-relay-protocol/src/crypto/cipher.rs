//! Symmetric cipher keyed by the application shared secret
//!
//! AES-256 in CBC mode with PKCS7 padding. The key is SHA-256 of the shared
//! secret and the IV is sixteen zero bytes, so identical plaintexts always
//! produce identical ciphertexts. Both peers derive the same IV, changing it
//! means changing the wire format on both sides.

use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use openssl::symm::{self, Cipher};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fixed initialization vector shared by every peer
pub const FIXED_IV: [u8; 16] = [0u8; 16];

/// Pre-shared application secret
///
/// Passed in at construction so tests can run with distinct secrets.
#[derive(Clone)]
pub struct SharedSecret {
    phrase: String,
    key: [u8; 32],
}

impl SharedSecret {
    /// Create a secret from its passphrase
    pub fn new(phrase: impl Into<String>) -> Self {
        let phrase = phrase.into();
        let key: [u8; 32] = Sha256::digest(phrase.as_bytes()).into();
        Self { phrase, key }
    }

    /// The passphrase itself, used as the handshake header prefix
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` with the shared secret
pub fn encrypt_symmetric(plaintext: &[u8], secret: &SharedSecret) -> Result<Vec<u8>> {
    Ok(symm::encrypt(
        Cipher::aes_256_cbc(),
        secret.key(),
        Some(&FIXED_IV),
        plaintext,
    )?)
}

/// Decrypt `ciphertext` with the shared secret
///
/// Any cipher failure (bad padding, truncated block) is a `DecryptionFailed`.
pub fn decrypt_symmetric(ciphertext: &[u8], secret: &SharedSecret) -> Result<Vec<u8>> {
    symm::decrypt(
        Cipher::aes_256_cbc(),
        secret.key(),
        Some(&FIXED_IV),
        ciphertext,
    )
    .map_err(|e| ProtocolError::DecryptionFailed(e.to_string()))
}

/// Encrypt a string and encode the ciphertext as base64
pub fn seal_text(plaintext: &str, secret: &SharedSecret) -> Result<String> {
    let ciphertext = encrypt_symmetric(plaintext.as_bytes(), secret)?;
    Ok(STANDARD.encode(ciphertext))
}

/// Decode base64 ciphertext and decrypt it back to a UTF-8 string
pub fn open_text(encoded: &str, secret: &SharedSecret) -> Result<String> {
    let ciphertext = decode_base64(encoded)
        .map_err(|e| ProtocolError::DecryptionFailed(format!("bad base64: {}", e)))?;
    let plaintext = decrypt_symmetric(&ciphertext, secret)?;
    String::from_utf8(plaintext)
        .map_err(|_| ProtocolError::DecryptionFailed("plaintext is not UTF-8".to_string()))
}

/// Decode base64, tolerating the line wrapping some encoders insert
pub(crate) fn decode_base64(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}
