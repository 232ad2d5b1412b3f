mod config;
mod diagnostics;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use otp_relay_protocol::crypto::{KeyManager, KeyManagerConfig, SharedSecret};
use otp_relay_protocol::delivery::{DeliveryEvent, DeliveryQueue, LanDiscovery};
use otp_relay_protocol::device::RegistryStore;
use otp_relay_protocol::pairing::{OpenedVerification, PairingConfig, PairingEvent, PairingPayload, PairingService};
use otp_relay_protocol::relay::{
    ChallengePolicy, RelayClient, RelayHandler, RelayMessage, RelayPayload, RelayServer, ServerEvent,
};
use otp_relay_protocol::{DeviceType, JsonFileRegistry, NetworkScanner};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use config::Config;
use diagnostics::{Cli, Command};

/// Receives relayed frames on behalf of the daemon
struct DaemonHandler {
    pairing: Arc<PairingService>,
    registry: Arc<JsonFileRegistry>,
}

#[async_trait]
impl RelayHandler for DaemonHandler {
    async fn on_message(
        &self,
        remote_addr: SocketAddr,
        message: RelayMessage,
    ) -> otp_relay_protocol::Result<()> {
        let sent_at = chrono::DateTime::from_timestamp(message.sent_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| message.sent_at.to_string());
        info!(
            "Received message {} from {} (sent {})",
            message.message_id, remote_addr, sent_at
        );
        println!("{}", message.body);
        Ok(())
    }

    async fn on_pairing(
        &self,
        remote_addr: SocketAddr,
        payload: PairingPayload,
    ) -> otp_relay_protocol::Result<()> {
        info!("Pairing request from {} at {}", payload.device_id, remote_addr);
        self.pairing.accept_payload(payload).await.map(|_| ())
    }

    async fn on_verification(
        &self,
        remote_addr: SocketAddr,
        verification: OpenedVerification,
    ) -> otp_relay_protocol::Result<()> {
        let device_id = verification.verify_with(self.registry.as_ref()).await?;
        info!("{} verified as paired device {}", remote_addr, device_id);
        Ok(())
    }
}

/// Main daemon state
struct Daemon {
    /// Configuration
    config: Config,

    secret: SharedSecret,

    /// Paired devices, shared with the pairing service
    registry: Arc<JsonFileRegistry>,

    pairing: Arc<PairingService>,
}

impl Daemon {
    /// Create a new daemon
    fn new(mut config: Config) -> Result<Self> {
        // Ensure directories exist
        config.ensure_directories()
            .context("Failed to create directories")?;

        let device_id = config.device_id()?;
        let device_type = config
            .device
            .device_type
            .parse::<DeviceType>()
            .unwrap_or(DeviceType::Desktop);

        let secret = SharedSecret::new(config.security.shared_secret.clone());
        let key_manager = KeyManager::new(KeyManagerConfig::new(
            config.security.shared_secret.clone(),
            config.key_store_path(),
        ));

        let registry = Arc::new(
            JsonFileRegistry::open(config.registry_path())
                .context("Failed to open paired device registry")?,
        );

        let pairing_config = PairingConfig {
            device_id,
            device_name: config.device.name.clone(),
            device_type,
        };
        let registry_store: Arc<dyn RegistryStore> = registry.clone();
        let pairing = PairingService::new(pairing_config, key_manager, registry_store)
            .context("Failed to load signing keys; pairing state is lost, run reset-keys")?;

        Ok(Self {
            config,
            secret,
            registry,
            pairing: Arc::new(pairing),
        })
    }

    fn scanner(&self) -> NetworkScanner {
        NetworkScanner::new(self.config.scan_options())
    }

    fn client(&self) -> RelayClient {
        let mut session = self.config.session_config();
        if self.config.security.require_verification {
            session.challenge = ChallengePolicy::Require(self.registry.clone());
        }
        RelayClient::new(self.secret.clone(), session)
    }

    /// Host the relay server until Ctrl+C
    async fn serve(&self) -> Result<()> {
        let mut server_config = self.config.server_config();
        if self.config.security.send_verification {
            server_config.verification_frame = Some(
                self.pairing
                    .verification_frame()
                    .await
                    .context("Failed to build verification frame")?,
            );
        }

        let handler = Arc::new(DaemonHandler {
            pairing: self.pairing.clone(),
            registry: self.registry.clone(),
        });
        let server = RelayServer::new(server_config, self.secret.clone(), handler);
        let mut server_events = server.subscribe().await;
        let mut pairing_events = self.pairing.subscribe().await;

        let local_addr = server.start().await.context("Failed to start relay server")?;

        info!("OTP relay daemon running");
        info!("Device: {} ({})", self.config.device.name, self.pairing.device_id());
        info!("Key fingerprint: {}", self.pairing.fingerprint().await);
        info!("Listening on {}", local_addr);
        info!("Press Ctrl+C to stop");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                    info!("Received shutdown signal");
                    break;
                }
                Some(event) = server_events.recv() => log_server_event(&event),
                Some(event) = pairing_events.recv() => log_pairing_event(&event),
            }
        }

        server.stop().await;
        info!("Daemon shutdown complete");
        Ok(())
    }

    async fn print_pairing_code(&self) -> Result<()> {
        let code = self.pairing.pairing_code().await?;
        println!("{}", code);
        eprintln!(
            "{} ({}), key fingerprint {}",
            self.config.device.name,
            self.pairing.device_id(),
            self.pairing.fingerprint().await
        );
        Ok(())
    }

    async fn pair(&self, code: &str) -> Result<()> {
        match self.pairing.accept_pairing_code(code).await {
            Ok(device) => {
                println!(
                    "Paired with {} ({}), key fingerprint {}",
                    device.device_name,
                    device.device_id,
                    device.fingerprint()
                );
                Ok(())
            }
            Err(e) => bail!("{}", e.user_message()),
        }
    }

    async fn unpair(&self, device_id: &str) -> Result<()> {
        let device = self
            .pairing
            .unpair(device_id)
            .await
            .with_context(|| format!("Failed to unpair {}", device_id))?;
        println!("Unpaired {} ({})", device.device_name, device.device_id);
        Ok(())
    }

    async fn list_devices(&self) -> Result<()> {
        let devices = self.pairing.paired_devices().await?;
        if devices.is_empty() {
            println!("No paired devices");
            return Ok(());
        }

        for device in devices {
            println!(
                "{}  {}  {}  {}",
                device.device_id,
                device.device_name,
                device.device_type,
                device.fingerprint()
            );
        }
        Ok(())
    }

    async fn scan(&self, prefix: Option<String>) -> Result<()> {
        let scanner = self.scanner();
        let port = self.config.network.relay_port;
        let prefix = prefix.or_else(|| self.config.network.subnet_prefix.clone());

        let report = match prefix {
            Some(prefix) => scanner.discover_reachable(&prefix, port).await,
            None => scanner.discover_local(port).await,
        }
        .context("Scan failed")?;

        for endpoint in &report.endpoints {
            println!("{}", endpoint);
        }
        eprintln!(
            "{} endpoint(s) out of {} probed in {:?}",
            report.endpoints.len(),
            report.probed,
            report.elapsed
        );
        Ok(())
    }

    fn delivery_queue(&self) -> DeliveryQueue {
        let source = LanDiscovery::new(
            self.scanner(),
            self.config.network.relay_port,
            self.config.network.subnet_prefix.clone(),
        );
        DeliveryQueue::new(
            self.config.delivery_config(),
            Arc::new(source),
            Arc::new(self.client()),
        )
    }

    async fn send(&self, text: String) -> Result<()> {
        let queue = self.delivery_queue();

        let mut events = queue.subscribe().await;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_delivery_event(&event);
            }
        });

        queue.enqueue(RelayPayload::message(text)).await;

        for outcome in queue.run_pending().await {
            match outcome.result {
                Ok(endpoint) => println!("Delivered to {}", endpoint),
                Err(e) => bail!("{}", e.user_message()),
            }
        }
        Ok(())
    }

    /// Deliver every line read from stdin until input ends
    ///
    /// Lines are queued as they arrive and the queue worker starts them on
    /// its next tick, so a message never waits behind one still retrying.
    async fn forward(&self) -> Result<()> {
        let queue = Arc::new(self.delivery_queue());
        let mut events = queue.subscribe().await;
        let worker = queue.spawn_worker(self.config.worker_interval());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut input_open = true;
        let mut outstanding = HashSet::new();
        let mut failed = 0usize;

        while input_open || !outstanding.is_empty() {
            tokio::select! {
                line = lines.next_line(), if input_open => {
                    match line.context("Failed to read stdin")? {
                        Some(text) if text.trim().is_empty() => {}
                        Some(text) => {
                            outstanding.insert(queue.enqueue(RelayPayload::message(text.trim())).await);
                        }
                        None => input_open = false,
                    }
                }
                Some(event) = events.recv() => {
                    log_delivery_event(&event);
                    match event {
                        DeliveryEvent::Delivered { attempt_id, endpoint } => {
                            if outstanding.remove(&attempt_id) {
                                println!("{} delivered to {}", attempt_id, endpoint);
                            }
                        }
                        DeliveryEvent::Failed { attempt_id, reason } => {
                            if outstanding.remove(&attempt_id) {
                                failed += 1;
                                eprintln!("{} not delivered: {}", attempt_id, reason);
                            }
                        }
                        _ => {}
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                    warn!("Interrupted with {} message(s) in flight", outstanding.len());
                    break;
                }
            }
        }

        worker.abort();
        if failed > 0 {
            bail!("{} message(s) could not be delivered", failed);
        }
        Ok(())
    }

    async fn reset_keys(&self) -> Result<()> {
        let fingerprint = self
            .pairing
            .reset_keys()
            .await
            .context("Failed to reset keys")?;
        println!("New key fingerprint {}", fingerprint);
        println!("All pairings were removed; pair your devices again");
        Ok(())
    }
}

fn log_server_event(event: &ServerEvent) {
    match event {
        ServerEvent::PeerRejected { remote_addr, reason } => {
            warn!("Peer {} rejected: {}", remote_addr, reason)
        }
        other => debug!("Server event: {:?}", other),
    }
}

fn log_delivery_event(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::RetryScheduled { retry_count, delay, .. } => {
            info!("Delivery cycle {} failed, retrying in {:?}", retry_count, delay)
        }
        other => debug!("Delivery event: {:?}", other),
    }
}

fn log_pairing_event(event: &PairingEvent) {
    match event {
        PairingEvent::PairingAccepted {
            device_name,
            key_fingerprint,
            replaced,
            ..
        } => info!(
            "Paired with {} ({}){}",
            device_name,
            key_fingerprint,
            if *replaced { ", replacing the previous pairing" } else { "" }
        ),
        PairingEvent::PairingRejected { reason, .. } => warn!("Pairing rejected: {}", reason),
        other => debug!("Pairing event: {:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    diagnostics::init_logging(&cli)?;

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    debug!("Configuration loaded from {:?}", config.paths.config_dir);

    let daemon = Daemon::new(config).context("Failed to create daemon")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => daemon.serve().await,
        Command::PairCode => daemon.print_pairing_code().await,
        Command::Pair { code } => daemon.pair(&code).await,
        Command::Unpair { device_id } => daemon.unpair(&device_id).await,
        Command::Devices => daemon.list_devices().await,
        Command::Scan { prefix } => daemon.scan(prefix).await,
        Command::Send { text } => daemon.send(text).await,
        Command::Forward => daemon.forward().await,
        Command::ResetKeys => daemon.reset_keys().await,
    }
}
