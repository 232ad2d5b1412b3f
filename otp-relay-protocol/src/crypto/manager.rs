//! Persistent keypair management
//!
//! The relay-hosting side owns exactly one signing keypair. It is generated
//! on first use and persisted with both halves encrypted under the shared
//! secret:
//!
//! ```json
//! { "version": 1, "publicKey": "<base64 AES(pem)>", "privateKey": "<base64 AES(pem)>" }
//! ```
//!
//! A store that exists but cannot be decrypted is never silently replaced.
//! It surfaces as [`ProtocolError::KeyStore`] and only [`KeyManager::reset`]
//! gets past it.

use super::cipher::{self, SharedSecret};
use super::keypair::KeyPair;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STORE_VERSION: u32 = 1;

/// Key manager configuration
#[derive(Debug, Clone)]
pub struct KeyManagerConfig {
    /// Pre-shared application secret
    pub shared_secret: SharedSecret,
    /// Location of the encrypted key store
    pub store_path: PathBuf,
}

impl KeyManagerConfig {
    pub fn new(shared_secret: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            shared_secret: SharedSecret::new(shared_secret),
            store_path: store_path.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    version: u32,
    public_key: String,
    private_key: String,
}

/// Owns the signing keypair and the shared secret
#[derive(Debug, Clone)]
pub struct KeyManager {
    secret: SharedSecret,
    store_path: PathBuf,
}

impl KeyManager {
    pub fn new(config: KeyManagerConfig) -> Self {
        Self {
            secret: config.shared_secret,
            store_path: config.store_path,
        }
    }

    /// Shared secret this manager encrypts with
    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    /// Path of the encrypted key store
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Load the persisted keypair, generating and persisting one if absent
    ///
    /// Idempotent: every call after the first returns the same keypair.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::KeyStore`] if a store exists but is corrupt or was
    /// written under a different secret.
    pub fn generate_or_load_key_pair(&self) -> Result<KeyPair> {
        if self.store_path.exists() {
            return self.load();
        }

        let keys = KeyPair::generate()?;
        self.persist(&keys)?;
        info!(
            "Generated signing keypair with fingerprint {}",
            keys.fingerprint()
        );
        Ok(keys)
    }

    /// Discard the persisted keypair and generate a new one
    ///
    /// Every pairing made with the old public key stops verifying.
    pub fn reset(&self) -> Result<KeyPair> {
        match fs::remove_file(&self.store_path) {
            Ok(()) => warn!("Deleted key store {:?}", self.store_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.generate_or_load_key_pair()
    }

    /// Encrypt bytes with the shared secret
    pub fn encrypt_symmetric(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        cipher::encrypt_symmetric(plaintext, &self.secret)
    }

    /// Decrypt bytes with the shared secret
    pub fn decrypt_symmetric(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        cipher::decrypt_symmetric(ciphertext, &self.secret)
    }

    /// Encrypt and base64-encode a string
    pub fn seal_text(&self, plaintext: &str) -> Result<String> {
        cipher::seal_text(plaintext, &self.secret)
    }

    /// Decode and decrypt a base64 string
    pub fn open_text(&self, encoded: &str) -> Result<String> {
        cipher::open_text(encoded, &self.secret)
    }

    fn load(&self) -> Result<KeyPair> {
        debug!("Loading signing keypair from {:?}", self.store_path);

        let raw = fs::read(&self.store_path)?;
        let stored: StoredKeyPair = serde_json::from_slice(&raw)
            .map_err(|e| ProtocolError::KeyStore(format!("unreadable key store: {}", e)))?;

        if stored.version != STORE_VERSION {
            return Err(ProtocolError::KeyStore(format!(
                "unsupported key store version {}",
                stored.version
            )));
        }

        let private_pem = self
            .open_text(&stored.private_key)
            .map_err(|e| ProtocolError::KeyStore(format!("private key: {}", e)))?;
        let public_pem = self
            .open_text(&stored.public_key)
            .map_err(|e| ProtocolError::KeyStore(format!("public key: {}", e)))?;

        let keys = KeyPair::from_private_pem(private_pem.as_bytes())
            .map_err(|e| ProtocolError::KeyStore(format!("private key: {}", e)))?;

        if keys.public_key_pem().trim() != public_pem.trim() {
            return Err(ProtocolError::KeyStore(
                "stored public key does not match private key".to_string(),
            ));
        }

        info!(
            "Loaded signing keypair with fingerprint {}",
            keys.fingerprint()
        );
        Ok(keys)
    }

    fn persist(&self, keys: &KeyPair) -> Result<()> {
        let private_pem = String::from_utf8(keys.private_key_pem()?)
            .map_err(|e| ProtocolError::KeyStore(e.to_string()))?;

        let stored = StoredKeyPair {
            version: STORE_VERSION,
            public_key: self.seal_text(keys.public_key_pem())?,
            private_key: self.seal_text(&private_pem)?,
        };

        if let Some(parent) = self.store_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.store_path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&stored)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp_path, &self.store_path)?;
        debug!("Saved signing keypair to {:?}", self.store_path);
        Ok(())
    }
}
