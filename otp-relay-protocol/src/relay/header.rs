//! Handshake header credential
//!
//! Every relay connection carries `x-otp-auth: base64(AES("<secret>+<unix seconds>"))`
//! on its upgrade request. The server accepts it when it decrypts under the
//! shared secret, names that same secret, and its timestamp lies within the
//! freshness window of the server clock (in either direction).

use crate::crypto::cipher::{self, SharedSecret};
use crate::{ProtocolError, Result};
use std::time::Duration;

/// Upgrade request header carrying the credential
pub const AUTH_HEADER: &str = "x-otp-auth";

/// Maximum accepted clock difference
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(600);

/// Short-lived credential proving possession of the shared secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    token: String,
}

impl HandshakeHeader {
    /// Issue a credential stamped with the current time
    pub fn issue(secret: &SharedSecret) -> Result<Self> {
        Self::issue_at(secret, unix_now())
    }

    /// Issue a credential stamped with `timestamp` (unix seconds)
    pub fn issue_at(secret: &SharedSecret, timestamp: i64) -> Result<Self> {
        let plaintext = format!("{}+{}", secret.phrase(), timestamp);
        Ok(Self {
            token: cipher::seal_text(&plaintext, secret)?,
        })
    }

    /// Header value
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Validate a received header value against the current time
    pub fn validate(token: &str, secret: &SharedSecret, window: Duration) -> Result<i64> {
        Self::validate_at(token, secret, window, unix_now())
    }

    /// Validate a received header value against `now` (unix seconds)
    ///
    /// Returns the embedded timestamp. Every failure is
    /// [`ProtocolError::ReplayOrExpired`].
    pub fn validate_at(token: &str, secret: &SharedSecret, window: Duration, now: i64) -> Result<i64> {
        let plaintext = cipher::open_text(token, secret)
            .map_err(|_| ProtocolError::ReplayOrExpired("credential does not decrypt".to_string()))?;

        let (phrase, timestamp) = plaintext
            .rsplit_once('+')
            .ok_or_else(|| ProtocolError::ReplayOrExpired("credential has no timestamp".to_string()))?;

        if phrase != secret.phrase() {
            return Err(ProtocolError::ReplayOrExpired(
                "credential names a different secret".to_string(),
            ));
        }

        let timestamp: i64 = timestamp.trim().parse().map_err(|_| {
            ProtocolError::ReplayOrExpired(format!("bad timestamp {:?}", timestamp))
        })?;

        let skew = now.saturating_sub(timestamp).unsigned_abs();
        if skew > window.as_secs() {
            return Err(ProtocolError::ReplayOrExpired(format!(
                "credential is {}s off, window is {}s",
                skew,
                window.as_secs()
            )));
        }

        Ok(timestamp)
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
