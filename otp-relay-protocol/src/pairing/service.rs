//! Pairing Service
//!
//! Owns this host's identity and signing keypair, turns scanned pairing
//! codes into registry records, and reports every outcome as a
//! [`PairingEvent`].

use super::codec::{self, PairingPayload};
use super::events::PairingEvent;
use crate::crypto::{KeyManager, KeyPair};
use crate::device::{DeviceType, PairedDevice, RegistryStore};
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Identity this host advertises when pairing
#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            device_name: "otp-relay".to_string(),
            device_type: DeviceType::Desktop,
        }
    }
}

/// Pairing service for managing paired devices
pub struct PairingService {
    /// Our identity
    config: PairingConfig,

    /// Key manager holding the shared secret and key store
    key_manager: KeyManager,

    /// Our signing keypair, replaced on reset
    keys: RwLock<KeyPair>,

    /// Paired device registry
    registry: Arc<dyn RegistryStore>,

    /// One write lock per device id
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<PairingEvent>,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<PairingEvent>>>,
}

impl PairingService {
    /// Create a new pairing service
    ///
    /// Loads (or generates) the signing keypair, so a corrupt key store
    /// fails here with [`ProtocolError::KeyStore`].
    pub fn new(
        config: PairingConfig,
        key_manager: KeyManager,
        registry: Arc<dyn RegistryStore>,
    ) -> Result<Self> {
        let keys = key_manager.generate_or_load_key_pair()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            "Pairing service ready for {} ({}), key fingerprint {}",
            config.device_name,
            config.device_id,
            keys.fingerprint()
        );

        Ok(Self {
            config,
            key_manager,
            keys: RwLock::new(keys),
            registry,
            device_locks: Mutex::new(HashMap::new()),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        })
    }

    /// Get a receiver for pairing events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PairingEvent> {
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

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    pub fn registry(&self) -> Arc<dyn RegistryStore> {
        self.registry.clone()
    }

    /// Current signing keypair
    pub async fn signing_key(&self) -> KeyPair {
        self.keys.read().await.clone()
    }

    /// Fingerprint of our public key
    pub async fn fingerprint(&self) -> String {
        self.keys.read().await.fingerprint()
    }

    /// Our identity as a pairing payload
    pub async fn local_payload(&self) -> PairingPayload {
        PairingPayload::new(
            self.config.device_name.clone(),
            self.config.device_id.clone(),
            self.config.device_type,
            self.keys.read().await.public_key_pem(),
        )
    }

    /// Sealed envelope of our identity, ready to render as a QR code
    pub async fn pairing_code(&self) -> Result<String> {
        let payload = self.local_payload().await;
        let keys = self.keys.read().await;
        let envelope = codec::build_sealed_envelope(&payload, self.key_manager.secret(), &keys)?;
        Ok(envelope.to_string())
    }

    /// Verification frame proving we hold our signing key
    pub async fn verification_frame(&self) -> Result<String> {
        let keys = self.keys.read().await;
        let frame = codec::build_verification(&self.config.device_id, self.key_manager.secret(), &keys)?;
        Ok(frame.to_string())
    }

    /// Open a scanned or relayed pairing code and record the device
    ///
    /// Rejections are reported as [`PairingEvent::PairingRejected`] and
    /// returned as the codec's error.
    pub async fn accept_pairing_code(&self, code: &str) -> Result<PairedDevice> {
        match codec::open_sealed_envelope(code, self.key_manager.secret()) {
            Ok(payload) => self.accept_payload(payload).await,
            Err(e) => {
                warn!("Rejected pairing code: {}", e);
                let _ = self.event_tx.send(PairingEvent::PairingRejected {
                    device_id: None,
                    reason: e.user_message(),
                });
                Err(e)
            }
        }
    }

    /// Record an already verified pairing payload
    ///
    /// Writes for one device id are serialized. Pairing again with a known
    /// id replaces the stored record.
    pub async fn accept_payload(&self, payload: PairingPayload) -> Result<PairedDevice> {
        if payload.device_id == self.config.device_id {
            let _ = self.event_tx.send(PairingEvent::PairingRejected {
                device_id: Some(payload.device_id.clone()),
                reason: "Cannot pair with this device itself.".to_string(),
            });
            return Err(ProtocolError::InvalidPayload(
                "payload carries our own device id".to_string(),
            ));
        }

        let lock = self.device_lock(&payload.device_id).await;
        let _guard = lock.lock().await;

        let device: PairedDevice = payload.into();
        let previous = self.registry.put(device.clone()).await?;

        if let Some(previous) = &previous {
            if previous.peer_public_key != device.peer_public_key {
                warn!(
                    "Device {} re-paired with a different key ({} -> {})",
                    device.device_id,
                    previous.fingerprint(),
                    device.fingerprint()
                );
            }
        }

        info!(
            "Paired with {} ({}), key fingerprint {}",
            device.device_name,
            device.device_id,
            device.fingerprint()
        );

        let _ = self.event_tx.send(PairingEvent::PairingAccepted {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            key_fingerprint: device.fingerprint(),
            replaced: previous.is_some(),
        });

        Ok(device)
    }

    /// Remove a paired device
    pub async fn unpair(&self, device_id: &str) -> Result<PairedDevice> {
        let lock = self.device_lock(device_id).await;
        let removed = {
            let _guard = lock.lock().await;
            self.registry.remove(device_id).await
        };
        self.release_device_lock(device_id, lock).await;

        let removed = removed?.ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        info!("Unpaired device {} ({})", removed.device_name, device_id);
        let _ = self.event_tx.send(PairingEvent::DeviceUnpaired {
            device_id: device_id.to_string(),
        });

        Ok(removed)
    }

    pub async fn is_paired(&self, device_id: &str) -> Result<bool> {
        Ok(self.registry.get(device_id).await?.is_some())
    }

    pub async fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        self.registry.list().await
    }

    /// Regenerate the signing keypair and drop every pairing
    pub async fn reset_keys(&self) -> Result<String> {
        let mut keys = self.keys.write().await;
        *keys = self.key_manager.reset()?;
        let removed = self.registry.clear().await?;
        self.device_locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        let key_fingerprint = keys.fingerprint();

        warn!(
            "Signing keys reset, {} pairings removed, new fingerprint {}",
            removed, key_fingerprint
        );
        let _ = self.event_tx.send(PairingEvent::KeysReset {
            key_fingerprint: key_fingerprint.clone(),
            removed,
        });

        Ok(key_fingerprint)
    }

    async fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.device_locks.lock().await;
        debug!("Acquiring registry lock for {}", device_id);
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry for `device_id` unless another task still holds it
    async fn release_device_lock(&self, device_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.device_locks.lock().await;
        drop(lock);
        if locks
            .get(device_id)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(device_id);
        }
    }
}
