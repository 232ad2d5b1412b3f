//! OTP Relay Protocol
//!
//! Pairs a desktop with a phone through a QR code carrying a sealed
//! envelope, then relays one-time passwords between them over an
//! authenticated WebSocket on the local network.
//!
//! ## Layers
//!
//! - [`crypto`]: shared-secret cipher, RSA identity and encrypted key store
//! - [`pairing`]: envelope codec and the pairing service
//! - [`device`]: paired device registry
//! - [`discovery`]: bounded concurrent subnet scan
//! - [`relay`]: handshake header, frames, client sessions and the server
//! - [`delivery`]: retrying delivery queue
//!
//! ## Example
//!
//! ```no_run
//! use otp_relay_protocol::crypto::{KeyManager, KeyManagerConfig, SharedSecret};
//! use otp_relay_protocol::pairing::{build_sealed_envelope, PairingPayload};
//! use otp_relay_protocol::device::DeviceType;
//!
//! # fn main() -> otp_relay_protocol::Result<()> {
//! let phrase = "correct horse battery staple";
//! let secret = SharedSecret::new(phrase);
//! let manager = KeyManager::new(KeyManagerConfig::new(phrase, "/tmp/otp-relay/keys.json"));
//! let keys = manager.generate_or_load_key_pair()?;
//!
//! let payload = PairingPayload::new("PC-1", "abc123", DeviceType::Desktop, keys.public_key_pem());
//! let code = build_sealed_envelope(&payload, &secret, &keys)?;
//! println!("{}", code);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod delivery;
pub mod device;
pub mod discovery;
pub mod pairing;
pub mod relay;

mod error;
pub use device::{DeviceType, JsonFileRegistry, MemoryRegistry, PairedDevice, RegistryStore};
pub use discovery::{Endpoint, NetworkScanner, ScanOptions};
pub use error::{ProtocolError, Result};
pub use relay::{RelayClient, RelayPayload, RelayServer, DEFAULT_RELAY_PORT};
