//! Integration tests for the relay protocol
//!
//! These run real relay servers on loopback and drive them with the client
//! session, the pairing service and the delivery queue.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use otp_relay_protocol::crypto::{KeyManager, KeyManagerConfig, SharedSecret};
use otp_relay_protocol::delivery::{DeliveryConfig, DeliveryEvent, DeliveryQueue, EndpointSource};
use otp_relay_protocol::device::{JsonFileRegistry, MemoryRegistry, RegistryStore};
use otp_relay_protocol::pairing::{PairingConfig, PairingPayload, PairingService};
use otp_relay_protocol::relay::{
    ChallengePolicy, HandshakeHeader, RelayClient, RelayHandler, RelayMessage, RelayPayload,
    RelayServer, ServerConfig, ServerEvent, SessionConfig, SessionState, AUTH_HEADER,
};
use otp_relay_protocol::{DeviceType, Endpoint, ProtocolError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const SECRET: &str = "integration-secret";

/// Handler that records messages and records pairings through a service
#[derive(Default)]
struct RecordingHandler {
    messages: Mutex<Vec<RelayMessage>>,
    pairing: Option<Arc<PairingService>>,
}

#[async_trait]
impl RelayHandler for RecordingHandler {
    async fn on_message(&self, _remote_addr: SocketAddr, message: RelayMessage) -> Result<()> {
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn on_pairing(&self, _remote_addr: SocketAddr, payload: PairingPayload) -> Result<()> {
        match &self.pairing {
            Some(service) => service.accept_payload(payload).await.map(|_| ()),
            None => Err(ProtocolError::Configuration("pairing disabled".to_string())),
        }
    }
}

fn loopback_config() -> ServerConfig {
    ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

async fn start_server(
    config: ServerConfig,
    handler: Arc<RecordingHandler>,
) -> (RelayServer, Endpoint) {
    let server = RelayServer::new(config, SharedSecret::new(SECRET), handler);
    let addr = server.start().await.expect("server should bind");
    let endpoint = match addr {
        SocketAddr::V4(v4) => Endpoint::from(v4),
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    };
    (server, endpoint)
}

fn client() -> RelayClient {
    RelayClient::new(SharedSecret::new(SECRET), quick_session())
}

fn quick_session() -> SessionConfig {
    SessionConfig {
        idle_timeout: Duration::from_millis(500),
        session_ceiling: Duration::from_secs(5),
        ..Default::default()
    }
}

fn pairing_service(dir: &TempDir, name: &str, id: &str, registry: Arc<dyn RegistryStore>) -> PairingService {
    let key_manager = KeyManager::new(KeyManagerConfig::new(
        SECRET,
        dir.path().join(format!("{}-keys.json", id)),
    ));
    let config = PairingConfig {
        device_id: id.to_string(),
        device_name: name.to_string(),
        device_type: DeviceType::Desktop,
    };
    PairingService::new(config, key_manager, registry).expect("pairing service")
}

/// Open an authenticated WebSocket without going through a session
async fn authenticated_socket(
    endpoint: Endpoint,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let header = HandshakeHeader::issue(&SharedSecret::new(SECRET)).unwrap();
    let mut request = format!("ws://{}/", endpoint.socket_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTH_HEADER, HeaderValue::from_str(header.token()).unwrap());
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn next_event<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn test_message_delivered_and_confirmed() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler.clone()).await;
    let mut events = server.subscribe().await;
    assert!(matches!(next_event(&mut events).await, ServerEvent::Started { .. }));

    let report = client()
        .send(endpoint, &RelayPayload::message("482913"))
        .await
        .expect("delivery should be confirmed");

    assert_eq!(report.sends, 1);
    assert_eq!(report.states.last(), Some(&SessionState::Closed));
    assert!(report.states.contains(&SessionState::AwaitingAck));

    let messages = handler.messages.lock().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "482913");
    drop(messages);

    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::MessageReceived { .. }
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_is_refused() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler.clone()).await;
    let mut events = server.subscribe().await;

    let impostor = RelayClient::new(SharedSecret::new("other-secret"), quick_session());
    let result = impostor.send(endpoint, &RelayPayload::message("482913")).await;

    assert!(matches!(result, Err(ProtocolError::DeliveryFailed { .. })));
    assert!(handler.messages.lock().await.is_empty());

    loop {
        match next_event(&mut events).await {
            ServerEvent::PeerRejected { .. } => break,
            ServerEvent::Started { .. } => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
    server.stop().await;
}

#[tokio::test]
async fn test_stale_header_gets_401() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler).await;

    let secret = SharedSecret::new(SECRET);
    let stale = chrono::Utc::now().timestamp() - 601;
    let header = HandshakeHeader::issue_at(&secret, stale).unwrap();

    let mut request = format!("ws://{}/", endpoint.socket_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTH_HEADER, HeaderValue::from_str(header.token()).unwrap());

    match tokio_tungstenite::connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("stale header was accepted"),
    }
    server.stop().await;
}

#[tokio::test]
async fn test_resent_message_is_acknowledged_once_handled() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler.clone()).await;

    let secret = SharedSecret::new(SECRET);
    let frame = RelayMessage::new("482913").seal(&secret).unwrap();
    let header = HandshakeHeader::issue(&secret).unwrap();
    let mut request = format!("ws://{}/", endpoint.socket_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTH_HEADER, HeaderValue::from_str(header.token()).unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    for _ in 0..2 {
        ws.send(Message::Text(frame.clone().into())).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(reply))) => assert_eq!(reply.as_str(), "confirmed"),
            other => panic!("unexpected reply {:?}", other),
        }
    }
    let _ = ws.close(None).await;

    assert_eq!(handler.messages.lock().await.len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_undecryptable_frame_is_rejected_in_band() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler.clone()).await;

    let header = HandshakeHeader::issue(&SharedSecret::new(SECRET)).unwrap();
    let mut request = format!("ws://{}/", endpoint.socket_addr())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTH_HEADER, HeaderValue::from_str(header.token()).unwrap());

    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let foreign = RelayMessage::new("482913")
        .seal(&SharedSecret::new("other-secret"))
        .unwrap();
    ws.send(Message::Text(foreign.into())).await.unwrap();

    match ws.next().await {
        Some(Ok(Message::Text(reply))) => assert!(reply.as_str().starts_with("rejected")),
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(handler.messages.lock().await.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_verification_challenge_identifies_server() {
    let dir = TempDir::new().unwrap();
    let server_side = pairing_service(&dir, "PC-1", "abc123", Arc::new(MemoryRegistry::new()));
    let client_registry = Arc::new(MemoryRegistry::new());
    let client_side = pairing_service(&dir, "Phone", "phone-1", client_registry.clone());

    client_side
        .accept_pairing_code(&server_side.pairing_code().await.unwrap())
        .await
        .unwrap();

    let config = ServerConfig {
        verification_frame: Some(server_side.verification_frame().await.unwrap()),
        ..loopback_config()
    };
    let (server, endpoint) = start_server(config, Arc::new(RecordingHandler::default())).await;

    let challenged = RelayClient::new(
        SharedSecret::new(SECRET),
        SessionConfig {
            challenge: ChallengePolicy::Require(client_registry),
            ..quick_session()
        },
    );
    let report = challenged
        .send(endpoint, &RelayPayload::message("482913"))
        .await
        .unwrap();
    assert_eq!(report.peer_device_id.as_deref(), Some("abc123"));
    assert!(report.states.contains(&SessionState::AwaitingChallenge));

    // A client that never paired with the server refuses to send
    let stranger = RelayClient::new(
        SharedSecret::new(SECRET),
        SessionConfig {
            challenge: ChallengePolicy::Require(Arc::new(MemoryRegistry::new())),
            ..quick_session()
        },
    );
    let result = stranger.send(endpoint, &RelayPayload::message("482913")).await;
    assert!(matches!(result, Err(ProtocolError::DeliveryFailed { .. })));

    server.stop().await;
}

#[tokio::test]
async fn test_qr_code_pairing_persists_device() {
    let dir = TempDir::new().unwrap();
    let desktop = pairing_service(&dir, "PC-1", "abc123", Arc::new(MemoryRegistry::new()));

    let registry_path = dir.path().join("paired.json");
    let registry = Arc::new(JsonFileRegistry::open(&registry_path).unwrap());
    let phone = pairing_service(&dir, "Phone", "phone-1", registry);

    let code = desktop.pairing_code().await.unwrap();
    let device = phone.accept_pairing_code(&code).await.unwrap();
    assert_eq!(device.device_id, "abc123");

    // Reopen from disk
    let reopened = JsonFileRegistry::open(&registry_path).unwrap();
    let stored = reopened.get("abc123").await.unwrap().expect("device stored");
    assert_eq!(stored.device_name, "PC-1");
    assert_eq!(stored.device_type, DeviceType::Desktop);
    assert_eq!(stored.peer_public_key, desktop.signing_key().await.public_key_pem());
}

#[tokio::test]
async fn test_pairing_envelope_over_relay() {
    let dir = TempDir::new().unwrap();
    let desktop = pairing_service(&dir, "PC-1", "abc123", Arc::new(MemoryRegistry::new()));
    let phone = Arc::new(pairing_service(&dir, "Phone", "phone-1", Arc::new(MemoryRegistry::new())));

    let handler = Arc::new(RecordingHandler {
        pairing: Some(phone.clone()),
        ..Default::default()
    });
    let (server, endpoint) = start_server(loopback_config(), handler).await;

    let code = desktop.pairing_code().await.unwrap();
    client()
        .send(endpoint, &RelayPayload::Pairing(code))
        .await
        .unwrap();

    assert!(phone.is_paired("abc123").await.unwrap());
    server.stop().await;
}

struct FixedEndpoints(Vec<Endpoint>);

#[async_trait]
impl EndpointSource for FixedEndpoints {
    async fn discover(&self) -> Result<Vec<Endpoint>> {
        Ok(self.0.clone())
    }
}

async fn closed_endpoint() -> Endpoint {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

#[tokio::test]
async fn test_delivery_queue_over_real_servers() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, live) = start_server(loopback_config(), handler.clone()).await;
    let dead = closed_endpoint().await;

    let queue = DeliveryQueue::new(
        DeliveryConfig {
            base_delay: Duration::from_millis(50),
            ..Default::default()
        },
        Arc::new(FixedEndpoints(vec![dead, live])),
        Arc::new(client()),
    );
    let mut events = queue.subscribe().await;

    queue.enqueue(RelayPayload::message("482913")).await;
    let outcomes = queue.run_pending().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].result.as_ref().unwrap(), &live);
    assert_eq!(handler.messages.lock().await.len(), 1);

    loop {
        let event = next_event(&mut events).await;
        if event.is_terminal() {
            assert!(matches!(event, DeliveryEvent::Delivered { endpoint, .. } if endpoint == live));
            break;
        }
    }
    server.stop().await;
}

#[tokio::test]
async fn test_delivery_queue_gives_up_without_servers() {
    let dead = closed_endpoint().await;
    let queue = DeliveryQueue::new(
        DeliveryConfig {
            base_delay: Duration::from_millis(20),
            ..Default::default()
        },
        Arc::new(FixedEndpoints(vec![dead])),
        Arc::new(client()),
    );

    queue.enqueue(RelayPayload::message("482913")).await;
    let outcomes = queue.run_pending().await;

    assert!(matches!(
        outcomes[0].result,
        Err(ProtocolError::RetriesExhausted { cycles: 3, .. })
    ));
}

#[tokio::test]
async fn test_graceful_stop() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler).await;
    let mut events = server.subscribe().await;

    server.stop().await;

    loop {
        if matches!(next_event(&mut events).await, ServerEvent::Stopped) {
            break;
        }
    }

    let result = client().send(endpoint, &RelayPayload::message("482913")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_silent_peer_does_not_block_others() {
    let handler = Arc::new(RecordingHandler::default());
    let (server, endpoint) = start_server(loopback_config(), handler.clone()).await;

    // Authenticated but never sends anything
    let mut silent = authenticated_socket(endpoint).await;

    let started = std::time::Instant::now();
    client()
        .send(endpoint, &RelayPayload::message("482913"))
        .await
        .expect("delivery should be confirmed while another peer idles");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handler.messages.lock().await[0].body, "482913");

    // The idle connection is still served afterwards
    let frame = RelayMessage::new("551234").seal(&SharedSecret::new(SECRET)).unwrap();
    silent.send(Message::Text(frame.into())).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), silent.next()).await {
        Ok(Some(Ok(Message::Text(reply)))) => assert_eq!(reply.as_str(), "confirmed"),
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(handler.messages.lock().await.len(), 2);

    let _ = silent.close(None).await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_aborts_open_session_after_grace() {
    let handler = Arc::new(RecordingHandler::default());
    let config = ServerConfig {
        shutdown_grace: Duration::from_millis(300),
        read_timeout: Duration::from_secs(30),
        ..loopback_config()
    };
    let (server, endpoint) = start_server(config, handler).await;
    let mut events = server.subscribe().await;

    let mut open = authenticated_socket(endpoint).await;

    let started = std::time::Instant::now();
    server.stop().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "stopped after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "stopped after {:?}", elapsed);

    // The session was torn down rather than left to its read timeout
    match tokio::time::timeout(Duration::from_secs(5), open.next()).await {
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {}
        other => panic!("session still open after stop: {:?}", other),
    }

    loop {
        if matches!(next_event(&mut events).await, ServerEvent::Stopped) {
            break;
        }
    }
}
