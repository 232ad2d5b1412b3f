//! Paired device registry
//!
//! A paired device is created when a pairing handshake succeeds, replaced
//! when the same device pairs again, and destroyed on explicit unpair. The
//! registry is keyed by `deviceId`.
//!
//! ## Persistence
//!
//! [`JsonFileRegistry`] keeps every record in one JSON object keyed by
//! device id and writes through on every mutation. Each value has the wire
//! shape peers already exchange:
//!
//! ```json
//! { "deviceName": "PC-1", "deviceId": "abc123", "deviceType": "desktop", "windowsPublicKey": "-----BEGIN PUBLIC KEY-----..." }
//! ```

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Kind of device on the other end of a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Mobile,
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Mobile => "mobile",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = std::convert::Infallible;

    /// Unrecognized names parse as [`DeviceType::Unknown`]
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "mobile" | "phone" => DeviceType::Mobile,
            _ => DeviceType::Unknown,
        })
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device that completed pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    pub device_name: String,
    pub device_id: String,
    pub device_type: DeviceType,
    /// Public key asserted by the peer when it paired
    #[serde(rename = "windowsPublicKey")]
    pub peer_public_key: String,
}

impl PairedDevice {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        peer_public_key: impl Into<String>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            device_id: device_id.into(),
            device_type,
            peer_public_key: peer_public_key.into(),
        }
    }

    /// Fingerprint of the peer's public key
    pub fn fingerprint(&self) -> String {
        crate::crypto::key_fingerprint(&self.peer_public_key)
    }
}

/// Key-value store of paired devices keyed by device id
///
/// `put` replaces any existing record for the same id. Callers that can race
/// on one device id serialize their writes (see `PairingService`).
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<PairedDevice>>;

    /// Insert or replace, returning the record that was replaced
    async fn put(&self, device: PairedDevice) -> Result<Option<PairedDevice>>;

    async fn remove(&self, device_id: &str) -> Result<Option<PairedDevice>>;

    async fn list(&self) -> Result<Vec<PairedDevice>>;

    async fn clear(&self) -> Result<usize>;
}

/// Resolves the public key a device paired with
#[async_trait]
pub trait PeerKeyLookup: Send + Sync {
    async fn peer_public_key(&self, device_id: &str) -> Option<String>;
}

#[async_trait]
impl<T: RegistryStore + ?Sized> PeerKeyLookup for T {
    async fn peer_public_key(&self, device_id: &str) -> Option<String> {
        match self.get(device_id).await {
            Ok(device) => device.map(|d| d.peer_public_key),
            Err(e) => {
                debug!("Registry lookup for {} failed: {}", device_id, e);
                None
            }
        }
    }
}

/// Registry persisted to a single JSON file
pub struct JsonFileRegistry {
    path: PathBuf,
    devices: RwLock<HashMap<String, PairedDevice>>,
}

impl JsonFileRegistry {
    /// Open the registry at `path`, loading existing records if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let devices = if path.exists() {
            let json = fs::read_to_string(&path)?;
            let devices: HashMap<String, PairedDevice> = serde_json::from_str(&json)?;
            info!("Loaded {} paired devices from {:?}", devices.len(), path);
            devices
        } else {
            debug!("No existing registry file at {:?}", path);
            HashMap::new()
        };

        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, devices: &HashMap<String, PairedDevice>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(devices)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        debug!("Saved device registry to {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for JsonFileRegistry {
    async fn get(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn put(&self, device: PairedDevice) -> Result<Option<PairedDevice>> {
        let mut devices = self.devices.write().await;
        let previous = devices.insert(device.device_id.clone(), device);
        self.save(&devices)?;
        Ok(previous)
    }

    async fn remove(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        let mut devices = self.devices.write().await;
        let removed = devices.remove(device_id);
        if removed.is_some() {
            self.save(&devices)?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<PairedDevice>> {
        let mut devices: Vec<_> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn clear(&self) -> Result<usize> {
        let mut devices = self.devices.write().await;
        let count = devices.len();
        devices.clear();
        self.save(&devices)?;
        Ok(count)
    }
}

/// In-memory registry
#[derive(Default)]
pub struct MemoryRegistry {
    devices: RwLock<HashMap<String, PairedDevice>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn get(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn put(&self, device: PairedDevice) -> Result<Option<PairedDevice>> {
        Ok(self
            .devices
            .write()
            .await
            .insert(device.device_id.clone(), device))
    }

    async fn remove(&self, device_id: &str) -> Result<Option<PairedDevice>> {
        Ok(self.devices.write().await.remove(device_id))
    }

    async fn list(&self) -> Result<Vec<PairedDevice>> {
        let mut devices: Vec<_> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn clear(&self) -> Result<usize> {
        let mut devices = self.devices.write().await;
        let count = devices.len();
        devices.clear();
        Ok(count)
    }
}
