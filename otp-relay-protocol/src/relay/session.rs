//! Outbound relay session
//!
//! One session pushes one frame to one endpoint and waits for the
//! acknowledgement:
//!
//! ```text
//! Connecting -> [AwaitingChallenge] -> Authenticated -> AwaitingAck -> Closed
//! ```
//!
//! `AwaitingChallenge` is only entered when the session requires the server
//! to prove its identity first. Every received frame re-arms the idle
//! timer. When the timer fires while waiting for the acknowledgement the
//! frame is sent again, at most `max_resends` times. The whole session is
//! bounded by a hard ceiling.
//!
//! Any failure comes back as [`ProtocolError::DeliveryFailed`] for this
//! endpoint only. Dropping the session future closes the socket and its
//! timers.

use super::frame::{is_challenge, is_confirmation};
use super::header::{HandshakeHeader, AUTH_HEADER};
use crate::crypto::SharedSecret;
use crate::device::PeerKeyLookup;
use crate::discovery::Endpoint;
use crate::pairing::codec;
use crate::{ProtocolError, Result};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Idle time allowed per exchange round
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard ceiling for a whole session
pub const DEFAULT_SESSION_CEILING: Duration = Duration::from_secs(180);

/// Extra sends after an idle timeout
pub const DEFAULT_MAX_RESENDS: u32 = 1;

/// Whether the server must prove its identity before we send
#[derive(Clone, Default)]
pub enum ChallengePolicy {
    /// Send the payload as soon as the connection opens
    #[default]
    None,
    /// Wait for a verification frame signed by a paired device
    Require(Arc<dyn PeerKeyLookup>),
}

impl fmt::Debug for ChallengePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengePolicy::None => f.write_str("None"),
            ChallengePolicy::Require(_) => f.write_str("Require"),
        }
    }
}

/// Client session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub session_ceiling: Duration,
    pub max_resends: u32,
    pub challenge: ChallengePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            session_ceiling: DEFAULT_SESSION_CEILING,
            max_resends: DEFAULT_MAX_RESENDS,
            challenge: ChallengePolicy::None,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingChallenge,
    Authenticated,
    AwaitingAck,
    Closed,
}

/// Successful session summary
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub endpoint: Endpoint,
    /// States in the order they were entered
    pub states: Vec<SessionState>,
    /// Times the frame went out, 1 plus resends
    pub sends: u32,
    /// Device id proven by the verification challenge
    pub peer_device_id: Option<String>,
    pub elapsed: Duration,
}

/// Client role of the relay protocol
pub struct RelaySession {
    endpoint: Endpoint,
    secret: SharedSecret,
    config: SessionConfig,
    states: Vec<SessionState>,
    sends: u32,
    peer_device_id: Option<String>,
}

impl RelaySession {
    pub fn new(endpoint: Endpoint, secret: SharedSecret, config: SessionConfig) -> Self {
        Self {
            endpoint,
            secret,
            config,
            states: Vec::new(),
            sends: 0,
            peer_device_id: None,
        }
    }

    pub fn state(&self) -> Option<SessionState> {
        self.states.last().copied()
    }

    /// Connect, authenticate, send `frame` and wait for the acknowledgement
    pub async fn deliver(mut self, frame: &str) -> Result<SessionReport> {
        let started = Instant::now();
        let ceiling = self.config.session_ceiling;

        let outcome = match timeout(ceiling, self.run(frame)).await {
            Ok(result) => result,
            Err(_) => Err(format!("session ceiling of {:?} reached", ceiling)),
        };
        self.enter(SessionState::Closed);

        match outcome {
            Ok(()) => {
                info!(
                    "Delivered to {} after {} send(s)",
                    self.endpoint, self.sends
                );
                Ok(SessionReport {
                    endpoint: self.endpoint,
                    states: self.states,
                    sends: self.sends,
                    peer_device_id: self.peer_device_id,
                    elapsed: started.elapsed(),
                })
            }
            Err(reason) => {
                debug!("Session to {} failed: {}", self.endpoint, reason);
                Err(ProtocolError::DeliveryFailed {
                    endpoint: self.endpoint.socket_addr(),
                    reason,
                })
            }
        }
    }

    fn enter(&mut self, state: SessionState) {
        debug!("Session to {} -> {:?}", self.endpoint, state);
        self.states.push(state);
    }

    async fn run(&mut self, frame: &str) -> std::result::Result<(), String> {
        let idle = self.config.idle_timeout;
        self.enter(SessionState::Connecting);

        let header = HandshakeHeader::issue(&self.secret).map_err(|e| e.to_string())?;
        let mut request = format!("ws://{}/", self.endpoint.socket_addr())
            .into_client_request()
            .map_err(|e| e.to_string())?;
        let value = HeaderValue::from_str(header.token()).map_err(|e| e.to_string())?;
        request.headers_mut().insert(AUTH_HEADER, value);

        let (ws, _response) = match timeout(idle, tokio_tungstenite::connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(format!("connect failed: {}", e)),
            Err(_) => return Err("connect timed out".to_string()),
        };
        let (mut sink, mut stream) = ws.split();

        if let ChallengePolicy::Require(keys) = self.config.challenge.clone() {
            self.enter(SessionState::AwaitingChallenge);
            loop {
                match timeout(idle, stream.next()).await {
                    Ok(Some(Ok(Message::Text(text)))) if is_challenge(text.as_str()) => {
                        let device_id = codec::open_verification(text.as_str(), &self.secret)
                            .map_err(|e| format!("bad challenge: {}", e))?
                            .verify_with(keys.as_ref())
                            .await
                            .map_err(|e| format!("challenge rejected: {}", e))?;
                        debug!("{} proved identity {}", self.endpoint, device_id);
                        self.peer_device_id = Some(device_id);
                        break;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        return Err("closed before challenge".to_string())
                    }
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(e))) => return Err(e.to_string()),
                    Err(_) => return Err("no verification challenge".to_string()),
                }
            }
        }
        self.enter(SessionState::Authenticated);

        sink.send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| e.to_string())?;
        self.sends = 1;
        self.enter(SessionState::AwaitingAck);

        loop {
            match timeout(idle, stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if is_confirmation(text.as_str()) {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    debug!("Ignoring reply from {}: {}", self.endpoint, text.as_str());
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                    return Err("closed before confirmation".to_string())
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.to_string()),
                Err(_) => {
                    if self.sends > self.config.max_resends {
                        return Err(format!("no confirmation after {} send(s)", self.sends));
                    }
                    warn!("No confirmation from {} yet, resending", self.endpoint);
                    sink.send(Message::Text(frame.to_string().into()))
                        .await
                        .map_err(|e| e.to_string())?;
                    self.sends += 1;
                }
            }
        }
    }
}
