//! Relay frames
//!
//! A text frame is classified by its dot-separated part count:
//!
//! - 1 part: application message, `base64(AES(json{messageId, body, sentAt}))`
//! - 2 parts: pairing envelope
//! - 3 parts: verification frame
//!
//! Anything else is a [`ProtocolError::MalformedEnvelope`].

use super::header::unix_now;
use crate::crypto::cipher::{self, SharedSecret};
use crate::pairing::codec::{self, OpenedEnvelope, OpenedVerification, PairingPayload};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Acknowledgement marker sent by the server
pub const CONFIRMED_MARKER: &str = "confirmed";

/// Prefix of the reply sent before the server drops a frame it cannot accept
pub const REJECTED_MARKER: &str = "rejected";

/// Application message carried over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Stable across resends and retries, used for de-duplication
    pub message_id: String,
    pub body: String,
    /// Unix seconds at creation
    pub sent_at: i64,
}

impl RelayMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            sent_at: unix_now(),
        }
    }

    /// Encrypt into a one-part frame
    pub fn seal(&self, secret: &SharedSecret) -> Result<String> {
        cipher::seal_text(&serde_json::to_string(self)?, secret)
    }

    /// Decrypt a one-part frame
    pub fn open(frame: &str, secret: &SharedSecret) -> Result<Self> {
        let json = cipher::open_text(frame, secret)?;
        let value: serde_json::Value = serde_json::from_str(&json).map_err(|e| {
            ProtocolError::DecryptionFailed(format!("plaintext is not JSON: {}", e))
        })?;
        let message: RelayMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        if message.message_id.is_empty() {
            return Err(ProtocolError::InvalidPayload("messageId is empty".to_string()));
        }
        Ok(message)
    }
}

/// Something the delivery queue sends
#[derive(Debug, Clone)]
pub enum RelayPayload {
    /// Application message such as a forwarded OTP
    Message(RelayMessage),
    /// Pre-built pairing envelope
    Pairing(String),
}

impl RelayPayload {
    /// Wrap a message body
    pub fn message(body: impl Into<String>) -> Self {
        RelayPayload::Message(RelayMessage::new(body))
    }

    /// Wire frame for this payload
    pub fn to_frame(&self, secret: &SharedSecret) -> Result<String> {
        match self {
            RelayPayload::Message(message) => message.seal(secret),
            RelayPayload::Pairing(envelope) => Ok(envelope.clone()),
        }
    }

    /// Short label for logs
    pub fn describe(&self) -> String {
        match self {
            RelayPayload::Message(message) => format!("message {}", message.message_id),
            RelayPayload::Pairing(_) => "pairing envelope".to_string(),
        }
    }
}

/// Frame received by the server, decrypted and classified
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Message(RelayMessage),
    /// Pairing envelope with its signature verified
    Pairing(PairingPayload),
    /// Verification frame, signature not yet checked
    Verification(OpenedVerification),
}

/// Decrypt and classify a received text frame
pub fn decode_frame(frame: &str, secret: &SharedSecret) -> Result<InboundFrame> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }

    if codec::part_count(frame) == 1 {
        return RelayMessage::open(frame, secret).map(InboundFrame::Message);
    }

    Ok(match codec::open_envelope(frame, secret)? {
        OpenedEnvelope::Pairing(payload) => InboundFrame::Pairing(payload),
        OpenedEnvelope::Verification(verification) => InboundFrame::Verification(verification),
    })
}

/// Whether a reply acknowledges delivery
pub fn is_confirmation(reply: &str) -> bool {
    reply.contains(CONFIRMED_MARKER)
}

/// Whether a reply is an identity challenge
pub fn is_challenge(reply: &str) -> bool {
    reply.contains(codec::VERIFICATION_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::device::DeviceType;

    #[test]
    fn test_message_frame() {
        let secret = SharedSecret::new("test-secret");
        let message = RelayMessage::new("Your code is 482913");
        let frame = RelayPayload::Message(message.clone()).to_frame(&secret).unwrap();

        assert_eq!(codec::part_count(&frame), 1);
        match decode_frame(&frame, &secret).unwrap() {
            InboundFrame::Message(decoded) => assert_eq!(decoded, message),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_pairing_frame() {
        let secret = SharedSecret::new("test-secret");
        let keys = KeyPair::generate().unwrap();
        let payload = PairingPayload::new("PC-1", "abc123", DeviceType::Desktop, keys.public_key_pem());
        let envelope = codec::build_sealed_envelope(&payload, &secret, &keys).unwrap();

        let frame = RelayPayload::Pairing(envelope.to_string()).to_frame(&secret).unwrap();
        match decode_frame(&frame, &secret).unwrap() {
            InboundFrame::Pairing(decoded) => assert_eq!(decoded, payload),
            other => panic!("expected pairing, got {:?}", other),
        }
    }

    #[test]
    fn test_message_with_wrong_shape() {
        let secret = SharedSecret::new("test-secret");
        let frame = cipher::seal_text(r#"{"text":"hi"}"#, &secret).unwrap();
        assert!(matches!(
            decode_frame(&frame, &secret),
            Err(ProtocolError::InvalidPayload(_))
        ));

        let frame = cipher::seal_text("plain words", &secret).unwrap();
        assert!(matches!(
            decode_frame(&frame, &secret),
            Err(ProtocolError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_bad_frames() {
        let secret = SharedSecret::new("test-secret");
        assert!(matches!(decode_frame(" ", &secret), Err(ProtocolError::EmptyPayload)));
        assert!(matches!(
            decode_frame("a.b.c.d", &secret),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_markers() {
        assert!(is_confirmation("confirmed"));
        assert!(is_confirmation("delivery confirmed by PC-1"));
        assert!(!is_confirmation("rejected: Signature invalid"));
        assert!(is_challenge("verification.abc.def"));
        assert!(!is_challenge("confirmed"));
    }
}
