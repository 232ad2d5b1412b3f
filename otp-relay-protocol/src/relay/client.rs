//! Relay client
//!
//! Opens one [`RelaySession`] per delivery.

use super::frame::RelayPayload;
use super::session::{RelaySession, SessionConfig, SessionReport};
use crate::crypto::SharedSecret;
use crate::discovery::Endpoint;
use crate::Result;

/// Sends payloads to relay endpoints
#[derive(Debug, Clone)]
pub struct RelayClient {
    secret: SharedSecret,
    config: SessionConfig,
}

impl RelayClient {
    pub fn new(secret: SharedSecret, config: SessionConfig) -> Self {
        Self { secret, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Deliver `payload` to `endpoint` over a fresh session
    pub async fn send(&self, endpoint: Endpoint, payload: &RelayPayload) -> Result<SessionReport> {
        let frame = payload.to_frame(&self.secret)?;
        RelaySession::new(endpoint, self.secret.clone(), self.config.clone())
            .deliver(&frame)
            .await
    }
}
