//! Device Pairing
//!
//! Pairing binds a peer's identity to its signing key through a sealed
//! envelope exchanged as a QR code or over the relay.
//!
//! ## Pairing Protocol
//!
//! 1. **Key Generation**: The relay-hosting side loads or generates its RSA keypair
//! 2. **Pairing Code**: It seals `{deviceName, deviceId, deviceType, publicKey}` into a two-part envelope
//! 3. **Transfer**: The envelope travels as a QR code or a relay frame
//! 4. **Verification**: The peer decrypts it and checks the signature against the embedded key
//! 5. **Registry**: The verified identity is stored under its device id
//!
//! ## Usage
//!
//! ```no_run
//! use otp_relay_protocol::pairing::{PairingConfig, PairingService};
//! use otp_relay_protocol::crypto::{KeyManager, KeyManagerConfig};
//! use otp_relay_protocol::device::MemoryRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> otp_relay_protocol::Result<()> {
//! let keys = KeyManager::new(KeyManagerConfig::new("secret", "/tmp/keypair.json"));
//! let service = PairingService::new(PairingConfig::default(), keys, Arc::new(MemoryRegistry::new()))?;
//! let code = service.pairing_code().await?;
//! println!("{}", code);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod events;
pub mod service;

pub use codec::{
    build_sealed_envelope, build_verification, open_envelope, open_sealed_envelope,
    open_verification, OpenedEnvelope, OpenedVerification, PairingPayload, RelayVerification,
    SealedEnvelope, VERIFICATION_TAG,
};
pub use events::PairingEvent;
pub use service::{PairingConfig, PairingService};
