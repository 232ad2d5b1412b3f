//! RSA signing keypair and signature primitives
//!
//! - **Algorithm**: RSA 2048-bit
//! - **Signature**: SHA-256 digest, PKCS#1 v1.5 padding
//! - **Public key encoding**: PEM (SubjectPublicKeyInfo); base64 DER is
//!   accepted on input

use super::cipher::decode_base64;
use crate::Result;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// RSA modulus size for newly generated keys
pub const KEY_BITS: u32 = 2048;

/// Signing keypair owned by the relay-hosting side
#[derive(Clone)]
pub struct KeyPair {
    private_key: PKey<Private>,
    public_key_pem: String,
}

impl KeyPair {
    /// Generate a fresh 2048-bit RSA keypair
    pub fn generate() -> Result<Self> {
        let rsa = Rsa::generate(KEY_BITS)?;
        let private_key = PKey::from_rsa(rsa)?;
        Self::from_private_key(private_key)
    }

    /// Rebuild a keypair from a PKCS#8 PEM private key
    pub fn from_private_pem(pem: &[u8]) -> Result<Self> {
        let private_key = PKey::private_key_from_pem(pem)?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: PKey<Private>) -> Result<Self> {
        let public_key_pem = String::from_utf8_lossy(&private_key.public_key_to_pem()?).into_owned();
        Ok(Self {
            private_key,
            public_key_pem,
        })
    }

    /// Public half as PEM text
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Private half as PKCS#8 PEM
    pub fn private_key_pem(&self) -> Result<Vec<u8>> {
        Ok(self.private_key.private_key_to_pem_pkcs8()?)
    }

    /// Fingerprint of the public half
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.public_key_pem)
    }

    /// Sign `data` with SHA-256/RSA
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verify a SHA-256/RSA signature against a public key
///
/// Never errors: an unparsable key or a bad signature is simply `false`, and
/// the caller must treat `false` as a rejected handshake.
pub fn verify(data: &[u8], signature: &[u8], public_key: &str) -> bool {
    let key = match parse_public_key(public_key) {
        Some(key) => key,
        None => {
            debug!("Public key could not be parsed, rejecting signature");
            return false;
        }
    };

    let outcome = Verifier::new(MessageDigest::sha256(), &key).and_then(|mut verifier| {
        verifier.update(data)?;
        verifier.verify(signature)
    });

    match outcome {
        Ok(valid) => valid,
        Err(e) => {
            debug!("Signature verification errored: {}", e);
            false
        }
    }
}

fn parse_public_key(public_key: &str) -> Option<PKey<Public>> {
    let trimmed = public_key.trim();
    if trimmed.starts_with("-----BEGIN") {
        PKey::public_key_from_pem(trimmed.as_bytes()).ok()
    } else {
        let der = decode_base64(trimmed).ok()?;
        PKey::public_key_from_der(&der).ok()
    }
}

/// SHA-256 fingerprint of a public key, formatted `XX:XX:...:XX`
pub fn key_fingerprint(public_key: &str) -> String {
    let hash = Sha256::digest(public_key.trim().as_bytes());
    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
