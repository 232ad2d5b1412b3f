//! Inbound relay server
//!
//! Accepts WebSocket connections, authenticates the upgrade request by its
//! handshake header, optionally challenges the peer with our verification
//! frame, and hands decoded frames to a [`RelayHandler`]. Each accepted
//! frame is answered with `confirmed`.
//!
//! Every connection runs in its own task, so a slow or silent peer only
//! holds its own socket until the read timeout closes it. On stop the
//! listener closes first, in-flight connections get a grace period, and
//! whatever is left is aborted.

use super::events::ServerEvent;
use super::frame::{decode_frame, InboundFrame, RelayMessage, CONFIRMED_MARKER, REJECTED_MARKER};
use super::header::{HandshakeHeader, AUTH_HEADER, DEFAULT_FRESHNESS_WINDOW};
use super::DEFAULT_RELAY_PORT;
use crate::crypto::SharedSecret;
use crate::pairing::{OpenedVerification, PairingPayload};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Close a connection after this long without a frame
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Time in-flight connections get after stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Message ids remembered for de-duplication
const RECENT_MESSAGE_CAPACITY: usize = 256;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    /// Accepted clock difference for the handshake header
    pub freshness_window: Duration,
    /// Per-frame read timeout
    pub read_timeout: Duration,
    pub shutdown_grace: Duration,
    pub recent_message_capacity: usize,
    /// Sent to every authenticated peer before reading, if set
    pub verification_frame: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RELAY_PORT,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            read_timeout: READ_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
            recent_message_capacity: RECENT_MESSAGE_CAPACITY,
            verification_frame: None,
        }
    }
}

/// Application side of the relay server
#[async_trait]
pub trait RelayHandler: Send + Sync {
    /// A message not seen before. An error withholds the confirmation.
    async fn on_message(&self, remote_addr: SocketAddr, message: RelayMessage) -> Result<()>;

    /// A pairing envelope whose signature already verified
    async fn on_pairing(&self, remote_addr: SocketAddr, payload: PairingPayload) -> Result<()>;

    /// A peer identifying itself with a verification frame
    async fn on_verification(
        &self,
        remote_addr: SocketAddr,
        verification: OpenedVerification,
    ) -> Result<()> {
        debug!(
            "{} identified as {} (unchecked)",
            remote_addr, verification.device_id
        );
        Ok(())
    }
}

/// Bounded set of recently handled message ids
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// `false` if already present
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    fn remove(&mut self, id: &str) {
        if self.seen.remove(id) {
            self.order.retain(|existing| existing != id);
        }
    }
}

/// State shared by every connection task
struct ServerContext {
    secret: SharedSecret,
    handler: Arc<dyn RelayHandler>,
    freshness_window: Duration,
    read_timeout: Duration,
    verification_frame: Option<String>,
    recent: Mutex<RecentIds>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerContext {
    fn authenticate(&self, request: &Request) -> Result<()> {
        let token = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ProtocolError::ReplayOrExpired("missing credential".to_string()))?;
        HandshakeHeader::validate(token, &self.secret, self.freshness_window)?;
        Ok(())
    }

    async fn handle_frame(&self, remote_addr: SocketAddr, text: &str) -> Result<()> {
        match decode_frame(text, &self.secret)? {
            InboundFrame::Message(message) => {
                let message_id = message.message_id.clone();
                if !self.recent.lock().await.insert(&message_id) {
                    debug!("Duplicate message {} from {}", message_id, remote_addr);
                    return Ok(());
                }

                if let Err(e) = self.handler.on_message(remote_addr, message).await {
                    self.recent.lock().await.remove(&message_id);
                    return Err(e);
                }

                let _ = self.event_tx.send(ServerEvent::MessageReceived {
                    remote_addr,
                    message_id,
                });
            }
            InboundFrame::Pairing(payload) => {
                let device_id = payload.device_id.clone();
                self.handler.on_pairing(remote_addr, payload).await?;
                let _ = self.event_tx.send(ServerEvent::PairingReceived {
                    remote_addr,
                    device_id,
                });
            }
            InboundFrame::Verification(verification) => {
                self.handler.on_verification(remote_addr, verification).await?;
            }
        }
        Ok(())
    }

    fn reject(&self, remote_addr: SocketAddr, reason: String) {
        warn!("Rejected peer {}: {}", remote_addr, reason);
        let _ = self
            .event_tx
            .send(ServerEvent::PeerRejected { remote_addr, reason });
    }
}

/// Relay server hosting the inbound side of the protocol
pub struct RelayServer {
    config: ServerConfig,
    secret: SharedSecret,
    handler: Arc<dyn RelayHandler>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<ServerEvent>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<ServerEvent>>>,

    shutdown_tx: watch::Sender<bool>,

    /// Accept loop task handle
    server_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, secret: SharedSecret, handler: Arc<dyn RelayHandler>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            secret,
            handler,
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            shutdown_tx,
            server_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Get a receiver for server events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward events
        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Bind and start accepting connections
    ///
    /// Returns the bound address, which differs from the configured one
    /// when the configured port is 0.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("binding {}", bind_addr)))?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(ServerContext {
            secret: self.secret.clone(),
            handler: self.handler.clone(),
            freshness_window: self.config.freshness_window,
            read_timeout: self.config.read_timeout,
            verification_frame: self.config.verification_frame.clone(),
            recent: Mutex::new(RecentIds::new(self.config.recent_message_capacity)),
            event_tx: self.event_tx.clone(),
        });

        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let grace = self.config.shutdown_grace;

        let _ = self.event_tx.send(ServerEvent::Started { local_addr });
        info!("Relay server listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(listener, context, shutdown_rx, grace));
        *self.server_task.write().await = Some(task);

        Ok(local_addr)
    }

    /// Stop accepting, drain in-flight connections, then return
    pub async fn stop(&self) {
        info!("Stopping relay server");
        self.shutdown_tx.send_replace(true);

        let task = self.server_task.write().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Relay server task failed: {}", e);
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!("Accepted connection from {}", remote_addr);
                    connections.spawn(handle_connection(stream, remote_addr, context.clone()));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    debug!("Draining {} connection(s)", connections.len());

    let drained = timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "Grace period elapsed, closing {} connection(s)",
            connections.len()
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    info!("Relay server stopped");
    let _ = context.event_tx.send(ServerEvent::Stopped);
}

async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, context: Arc<ServerContext>) {
    let mut rejection: Option<String> = None;
    let callback = |request: &Request, response: Response| match context.authenticate(request) {
        Ok(()) => Ok(response),
        Err(e) => {
            let reason = e.to_string();
            rejection = Some(reason.clone());
            let mut refusal = ErrorResponse::new(Some(reason));
            *refusal.status_mut() = StatusCode::UNAUTHORIZED;
            Err(refusal)
        }
    };

    let accepted = timeout(context.read_timeout, accept_hdr_async(stream, callback)).await;
    let ws = match accepted {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            let reason = rejection.unwrap_or_else(|| format!("handshake failed: {}", e));
            context.reject(remote_addr, reason);
            return;
        }
        Err(_) => {
            context.reject(remote_addr, "handshake timed out".to_string());
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    if let Some(frame) = &context.verification_frame {
        if let Err(e) = sink.send(Message::Text(frame.clone().into())).await {
            debug!("Failed to send challenge to {}: {}", remote_addr, e);
            return;
        }
    }

    loop {
        let message = match timeout(context.read_timeout, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Connection from {} failed: {}", remote_addr, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                debug!("Closing idle connection from {}", remote_addr);
                break;
            }
        };

        match message {
            Message::Text(text) => match context.handle_frame(remote_addr, text.as_str()).await {
                Ok(()) => {
                    if sink
                        .send(Message::Text(CONFIRMED_MARKER.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    context.reject(remote_addr, e.to_string());
                    let reply = format!("{}: {}", REJECTED_MARKER, e);
                    let _ = sink.send(Message::Text(reply.into())).await;
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = sink.close().await;
    debug!("Connection from {} closed", remote_addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_ids_are_bounded() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        // "a" was evicted
        assert!(recent.insert("a"));

        recent.remove("c");
        assert!(recent.insert("c"));
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9224);
        assert_eq!(config.freshness_window, Duration::from_secs(600));
        assert!(config.verification_frame.is_none());
    }
}
