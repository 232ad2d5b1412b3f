//! Pairing envelope codec
//!
//! Two dot-separated wire shapes carry identity between peers:
//!
//! | Parts | Shape | Used for |
//! |-------|-------|----------|
//! | 2 | `base64(AES(json)).base64(sign(json))` | QR code and relay-delivered pairing |
//! | 3 | `<tag>.base64(AES(deviceId)).base64(sign(deviceId))` | relay verification challenge |
//!
//! Signatures always cover the plaintext, never the ciphertext. A pairing
//! envelope is self-describing: its signature is checked against the public
//! key carried inside the decrypted payload. That proves the sender holds the
//! private half of the key it asserts, nothing more (trust on first use).

use crate::crypto::cipher::{self, decode_base64, SharedSecret};
use crate::crypto::keypair::{self, KeyPair};
use crate::device::{DeviceType, PairedDevice, PeerKeyLookup};
use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Separator between envelope parts
pub const ENVELOPE_SEPARATOR: char = '.';

/// Tag carried by a relay verification challenge
pub const VERIFICATION_TAG: &str = "verification";

/// Identity a device shares when pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub device_name: String,
    pub device_id: String,
    pub device_type: DeviceType,
    /// PEM public key of the sender
    pub public_key: String,
}

impl PairingPayload {
    pub fn new(
        device_name: impl Into<String>,
        device_id: impl Into<String>,
        device_type: DeviceType,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            device_id: device_id.into(),
            device_type,
            public_key: public_key.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(ProtocolError::InvalidPayload("deviceId is empty".to_string()));
        }
        if self.public_key.trim().is_empty() {
            return Err(ProtocolError::InvalidPayload("publicKey is empty".to_string()));
        }
        Ok(())
    }
}

impl From<PairingPayload> for PairedDevice {
    fn from(payload: PairingPayload) -> Self {
        PairedDevice {
            device_name: payload.device_name,
            device_id: payload.device_id,
            device_type: payload.device_type,
            peer_public_key: payload.public_key,
        }
    }
}

/// Two-part wire form of a [`PairingPayload`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    /// base64 AES ciphertext of the payload JSON
    pub ciphertext: String,
    /// base64 signature over the payload JSON
    pub signature: String,
}

impl fmt::Display for SealedEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.ciphertext, ENVELOPE_SEPARATOR, self.signature)
    }
}

/// Three-part wire form proving possession of a device's signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayVerification {
    pub tag: String,
    /// base64 AES ciphertext of the device id
    pub ciphertext: String,
    /// base64 signature over the device id
    pub signature: String,
}

impl fmt::Display for RelayVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{tag}{sep}{ct}{sep}{sig}",
            tag = self.tag,
            sep = ENVELOPE_SEPARATOR,
            ct = self.ciphertext,
            sig = self.signature
        )
    }
}

/// A verification frame after decryption, before signature checking
#[derive(Debug, Clone)]
pub struct OpenedVerification {
    pub tag: String,
    pub device_id: String,
    signature: Vec<u8>,
}

impl OpenedVerification {
    /// Check the signature over the device id against `public_key`
    pub fn verify(&self, public_key: &str) -> bool {
        keypair::verify(self.device_id.as_bytes(), &self.signature, public_key)
    }

    /// Check the signature against the key the device paired with
    ///
    /// Returns the verified device id.
    pub async fn verify_with(&self, keys: &dyn PeerKeyLookup) -> Result<String> {
        let public_key = keys
            .peer_public_key(&self.device_id)
            .await
            .ok_or_else(|| ProtocolError::DeviceNotFound(self.device_id.clone()))?;

        if !self.verify(&public_key) {
            warn!("Verification from {} has an invalid signature", self.device_id);
            return Err(ProtocolError::SignatureInvalid);
        }
        Ok(self.device_id.clone())
    }
}

/// Result of opening any multi-part envelope
#[derive(Debug, Clone)]
pub enum OpenedEnvelope {
    /// Two-part pairing envelope, signature already verified
    Pairing(PairingPayload),
    /// Three-part verification frame, signature not yet checked
    Verification(OpenedVerification),
}

/// Serialize, encrypt and sign a pairing payload
pub fn build_sealed_envelope(
    payload: &PairingPayload,
    secret: &SharedSecret,
    signing_key: &KeyPair,
) -> Result<SealedEnvelope> {
    let json = serde_json::to_string(payload)?;
    let ciphertext = cipher::seal_text(&json, secret)?;
    let signature = STANDARD.encode(signing_key.sign(json.as_bytes())?);

    Ok(SealedEnvelope {
        ciphertext,
        signature,
    })
}

/// Open a two-part pairing envelope
///
/// Returns the payload only if the plaintext decrypts, verifies against the
/// public key embedded in it, and then matches the payload schema.
///
/// # Errors
///
/// - [`ProtocolError::EmptyPayload`] for an empty string
/// - [`ProtocolError::MalformedEnvelope`] unless there are exactly two parts
/// - [`ProtocolError::DecryptionFailed`] on any cipher failure
/// - [`ProtocolError::SignatureInvalid`] if the signature does not verify or
///   there is no `publicKey` to verify it with
/// - [`ProtocolError::InvalidPayload`] on a schema mismatch of a signed payload
pub fn open_sealed_envelope(envelope: &str, secret: &SharedSecret) -> Result<PairingPayload> {
    let parts = split_parts(envelope)?;
    if parts.len() != 2 {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "pairing envelope needs 2 parts, got {}",
            parts.len()
        )));
    }
    open_pairing_parts(parts[0], parts[1], secret)
}

/// Build the verification frame for this host's device id
pub fn build_verification(
    device_id: &str,
    secret: &SharedSecret,
    signing_key: &KeyPair,
) -> Result<RelayVerification> {
    Ok(RelayVerification {
        tag: VERIFICATION_TAG.to_string(),
        ciphertext: cipher::seal_text(device_id, secret)?,
        signature: STANDARD.encode(signing_key.sign(device_id.as_bytes())?),
    })
}

/// Open a three-part verification frame
pub fn open_verification(envelope: &str, secret: &SharedSecret) -> Result<OpenedVerification> {
    let parts = split_parts(envelope)?;
    if parts.len() != 3 {
        return Err(ProtocolError::MalformedEnvelope(format!(
            "verification needs 3 parts, got {}",
            parts.len()
        )));
    }
    open_verification_parts(parts[0], parts[1], parts[2], secret)
}

/// Open either envelope shape, selected by part count
pub fn open_envelope(envelope: &str, secret: &SharedSecret) -> Result<OpenedEnvelope> {
    let parts = split_parts(envelope)?;
    match parts.as_slice() {
        [ciphertext, signature] => Ok(OpenedEnvelope::Pairing(open_pairing_parts(
            ciphertext, signature, secret,
        )?)),
        [tag, ciphertext, signature] => Ok(OpenedEnvelope::Verification(
            open_verification_parts(tag, ciphertext, signature, secret)?,
        )),
        _ => Err(ProtocolError::MalformedEnvelope(format!(
            "unsupported part count {}",
            parts.len()
        ))),
    }
}

/// Number of dot-separated parts, without validating them
pub fn part_count(envelope: &str) -> usize {
    envelope.trim().split(ENVELOPE_SEPARATOR).count()
}

fn split_parts(envelope: &str) -> Result<Vec<&str>> {
    let envelope = envelope.trim();
    if envelope.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }

    let parts: Vec<&str> = envelope.split(ENVELOPE_SEPARATOR).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(ProtocolError::MalformedEnvelope(
            "envelope has an empty part".to_string(),
        ));
    }
    Ok(parts)
}

fn open_pairing_parts(
    ciphertext: &str,
    signature: &str,
    secret: &SharedSecret,
) -> Result<PairingPayload> {
    let json = cipher::open_text(ciphertext, secret)?;

    let value: serde_json::Value = serde_json::from_str(&json).map_err(|e| {
        ProtocolError::DecryptionFailed(format!("plaintext is not JSON: {}", e))
    })?;

    // Authenticate the exact plaintext before trusting any field of it
    let public_key = value
        .get("publicKey")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::SignatureInvalid)?;
    let signature = decode_base64(signature).map_err(|_| ProtocolError::SignatureInvalid)?;
    if !keypair::verify(json.as_bytes(), &signature, public_key) {
        warn!(
            "Pairing envelope claiming {} has an invalid signature",
            value.get("deviceId").and_then(serde_json::Value::as_str).unwrap_or("<unknown>")
        );
        return Err(ProtocolError::SignatureInvalid);
    }

    let payload: PairingPayload = serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    payload.validate()?;

    debug!(
        "Opened pairing envelope for {} ({})",
        payload.device_name, payload.device_id
    );
    Ok(payload)
}

fn open_verification_parts(
    tag: &str,
    ciphertext: &str,
    signature: &str,
    secret: &SharedSecret,
) -> Result<OpenedVerification> {
    let device_id = cipher::open_text(ciphertext, secret)?;
    if device_id.trim().is_empty() {
        return Err(ProtocolError::InvalidPayload("deviceId is empty".to_string()));
    }
    let signature = decode_base64(signature).map_err(|_| ProtocolError::SignatureInvalid)?;

    Ok(OpenedVerification {
        tag: tag.to_string(),
        device_id,
        signature,
    })
}
