//! Cryptographic primitives
//!
//! - [`cipher`]: AES-256-CBC keyed by the shared secret
//! - [`keypair`]: RSA-2048 signing keys and SHA-256/RSA signatures
//! - [`manager`]: the persisted keypair of the relay-hosting side

pub mod cipher;
pub mod keypair;
pub mod manager;

pub use cipher::{decrypt_symmetric, encrypt_symmetric, open_text, seal_text, SharedSecret};
pub use keypair::{key_fingerprint, verify, KeyPair};
pub use manager::{KeyManager, KeyManagerConfig};
