//! Error handling for the OTP relay protocol
//!
//! Every fallible operation in this crate returns [`Result`], an alias over
//! [`ProtocolError`]. Underlying library errors (I/O, JSON, OpenSSL,
//! WebSocket) convert automatically through `From`, so `?` works everywhere.
//!
//! ## Error Categories
//!
//! ### Fatal
//! - `KeyStore`: the persisted keypair cannot be decrypted. Pairing state is
//!   lost and the user has to reset.
//!
//! ### Handshake rejections
//! Reject one pairing or one connection, never the process:
//! - `DecryptionFailed`, `SignatureInvalid`, `MalformedEnvelope`,
//!   `InvalidPayload`, `EmptyPayload`, `ReplayOrExpired`
//!
//! ### Delivery
//! - `DiscoveryTimeout`: expected noise while scanning, never logged as error
//! - `DeliveryFailed`: one endpoint failed, retried by the delivery queue
//! - `RetriesExhausted`: terminal, surfaced to the caller
//! - `NoDeviceReachable`: a scan found nothing to talk to
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::{debug, warn};
//!
//! match server.handle(conn).await {
//!     Err(ProtocolError::ReplayOrExpired(reason)) => warn!("Rejected peer: {}", reason),
//!     Err(e) if e.is_recoverable() => debug!("Transient failure: {}", e),
//!     Err(e) => return Err(e),
//!     Ok(()) => {}
//! }
//! ```

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during pairing, discovery and relay delivery
///
/// # Examples
///
/// ```rust
/// use otp_relay_protocol::ProtocolError;
///
/// let error = ProtocolError::MalformedEnvelope("4 parts".to_string());
/// assert_eq!(error.to_string(), "Malformed envelope: 4 parts");
///
/// let error = ProtocolError::SignatureInvalid;
/// assert_eq!(error.to_string(), "Signature invalid");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// OpenSSL failure outside of a handshake (key generation, signing)
    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The persisted keypair could not be loaded
    ///
    /// Fatal: the only way forward is an explicit key reset, which
    /// invalidates every existing pairing.
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Symmetric decryption failed (wrong secret, tampered or truncated data)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signature did not verify against the asserted public key
    #[error("Signature invalid")]
    SignatureInvalid,

    /// Envelope does not have a supported number of parts
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Decrypted payload does not match the expected schema
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Nothing was handed to the codec
    #[error("Empty payload")]
    EmptyPayload,

    /// A discovery probe ran out of time
    #[error("Discovery timeout: {0}")]
    DiscoveryTimeout(String),

    /// Handshake header is stale, from the future, or not ours
    #[error("Replay or expired credential: {0}")]
    ReplayOrExpired(String),

    /// One relay session did not get a confirmation
    #[error("Delivery to {endpoint} failed: {reason}")]
    DeliveryFailed {
        /// Endpoint the session talked to
        endpoint: SocketAddr,
        /// Why the session ended without confirmation
        reason: String,
    },

    /// A delivery attempt used up all of its retries
    #[error("Retries exhausted for attempt {attempt_id} after {cycles} cycles: {last_error}")]
    RetriesExhausted {
        /// Attempt identifier
        attempt_id: String,
        /// Number of full delivery cycles that ran
        cycles: u32,
        /// Why the final cycle failed
        #[source]
        last_error: Box<ProtocolError>,
    },

    /// Discovery found no endpoint to deliver to
    #[error("No device reachable")]
    NoDeviceReachable,

    /// Paired device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use otp_relay_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::ConnectionRefused, "refused");
    /// let error = ProtocolError::from_io_error(io_error, "probing 10.0.0.7");
    ///
    /// assert!(matches!(error, ProtocolError::ConnectionRefused(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and worth another delivery cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::DiscoveryTimeout(_)
                | ProtocolError::DeliveryFailed { .. }
                | ProtocolError::NoDeviceReachable
                | ProtocolError::WebSocket(_)
                | ProtocolError::Io(_)
        )
    }

    /// Only a broken key store is allowed to take the process down
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::KeyStore(_))
    }

    /// Check if this error requires user action
    ///
    /// ```rust
    /// use otp_relay_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::KeyStore("bad padding".into()).requires_user_action());
    /// assert!(!ProtocolError::NoDeviceReachable.requires_user_action());
    /// ```
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::KeyStore(_)
                | ProtocolError::SignatureInvalid
                | ProtocolError::EmptyPayload
                | ProtocolError::RetriesExhausted { .. }
                | ProtocolError::Configuration(_)
        )
    }

    /// Get a user-friendly error message suitable for display in UI
    ///
    /// ```rust
    /// use otp_relay_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::NoDeviceReachable.user_message(),
    ///     "No device reachable. Check that both devices are on the same network."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::KeyStore(_) => {
                "Pairing state lost, reset required.".to_string()
            }
            ProtocolError::SignatureInvalid => {
                "Signature invalid. The pairing code was not produced by that device.".to_string()
            }
            ProtocolError::EmptyPayload => {
                "Pairing code is empty. Scan the code again.".to_string()
            }
            ProtocolError::NoDeviceReachable => {
                "No device reachable. Check that both devices are on the same network."
                    .to_string()
            }
            ProtocolError::DecryptionFailed(_) => {
                "Could not decrypt the pairing code. Both apps must use the same release."
                    .to_string()
            }
            ProtocolError::MalformedEnvelope(_) | ProtocolError::InvalidPayload(_) => {
                "The pairing code is not valid. Scan the code again.".to_string()
            }
            ProtocolError::ReplayOrExpired(_) => {
                "Connection rejected. Check that both clocks are correct.".to_string()
            }
            ProtocolError::RetriesExhausted { last_error, .. }
                if matches!(**last_error, ProtocolError::NoDeviceReachable) =>
            {
                last_error.user_message()
            }
            ProtocolError::RetriesExhausted { .. } => {
                "Message could not be delivered.".to_string()
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' is not paired.", id)
            }
            ProtocolError::DeliveryFailed { endpoint, .. } => {
                format!("Delivery to {} failed.", endpoint)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check that the desktop app is running.".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check that both devices are on the same network."
                    .to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::DiscoveryTimeout(msg) => format!("Discovery timeout: {}.", msg),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Crypto(e) => format!("Crypto error: {}.", e),
            ProtocolError::WebSocket(e) => format!("Connection error: {}.", e),
        }
    }
}
