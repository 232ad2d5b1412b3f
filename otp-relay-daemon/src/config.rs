//! Daemon Configuration
//!
//! Configuration management for the OTP relay daemon.

use anyhow::{Context, Result};
use otp_relay_protocol::delivery::DeliveryConfig;
use otp_relay_protocol::discovery::ScanOptions;
use otp_relay_protocol::relay::{ServerConfig, SessionConfig};
use otp_relay_protocol::DEFAULT_RELAY_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "daemon.toml";
const APP_DIR: &str = "otp-relay";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Delivery retry configuration
    #[serde(default)]
    pub delivery: DeliverySettings,

    /// Shared secret and handshake settings
    pub security: SecurityConfig,

    /// Storage paths
    pub paths: PathConfig,

    /// File this configuration was loaded from, where `save` writes back
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name
    pub name: String,

    /// Device type (desktop, laptop, mobile)
    pub device_type: String,

    /// Device ID (generated on first run if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Relay TCP port
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Address the relay server binds
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Subnet to scan instead of the local interface's, e.g. "192.168.1"
    #[serde(default)]
    pub subnet_prefix: Option<String>,

    /// Hosts probed concurrently
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,

    /// TCP connect timeout per probe in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Overall timeout per probe in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Wait for an acknowledgement before resending, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Hard limit for one session in seconds
    #[serde(default = "default_session_ceiling")]
    pub session_ceiling: u64,
}

/// Delivery retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Full discovery and send cycles per message
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in seconds, doubled for each further retry
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,

    /// Retry delay cap in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,

    /// Queue polling interval in seconds
    #[serde(default = "default_worker_interval")]
    pub worker_interval: u64,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret pre-shared with the paired phone
    pub shared_secret: String,

    /// Accepted handshake clock difference in seconds
    #[serde(default = "default_freshness_window")]
    pub freshness_window: u64,

    /// Send our verification frame to every peer that connects
    #[serde(default)]
    pub send_verification: bool,

    /// Only send to servers that prove they are a paired device
    #[serde(default)]
    pub require_verification: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (key store, paired devices)
    pub data_dir: PathBuf,
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_scan_batch_size() -> usize {
    50
}

fn default_connect_timeout_ms() -> u64 {
    200
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_session_ceiling() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    60
}

fn default_worker_interval() -> u64 {
    5
}

fn default_freshness_window() -> u64 {
    600
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_port: default_relay_port(),
            bind_address: default_bind_address(),
            subnet_prefix: None,
            scan_batch_size: default_scan_batch_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            idle_timeout: default_idle_timeout(),
            session_ceiling: default_session_ceiling(),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            worker_interval: default_worker_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir();

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(APP_DIR);

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: "desktop".to_string(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            delivery: DeliverySettings::default(),
            security: SecurityConfig {
                shared_secret: uuid::Uuid::new_v4().simple().to_string(),
                freshness_window: default_freshness_window(),
                send_verification: false,
                require_verification: false,
            },
            paths: PathConfig {
                config_dir,
                data_dir,
            },
            source_path: None,
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR)
}

impl Config {
    /// Load configuration from file, creating default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&default_config_dir().join(CONFIG_FILE))
    }

    /// Load configuration from `config_path`, creating default if not found
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {:?}", config_path))?;
            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", config_path))?;
            config.source_path = Some(config_path.to_path_buf());
            Ok(config)
        } else {
            // Create default config
            let mut config = Config::default();
            if let Some(parent) = config_path.parent() {
                config.paths.config_dir = parent.to_path_buf();
            }
            config.source_path = Some(config_path.to_path_buf());
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to the file it came from, or to the config dir
    pub fn save(&self) -> Result<()> {
        let config_path = self
            .source_path
            .clone()
            .unwrap_or_else(|| self.paths.config_dir.join(CONFIG_FILE));

        // Ensure config directory exists
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir)
            .context("Failed to create data directory")?;
        Ok(())
    }

    /// Device id, generated and saved on first use
    pub fn device_id(&mut self) -> Result<String> {
        if let Some(id) = &self.device.device_id {
            return Ok(id.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.device.device_id = Some(id.clone());
        self.save().context("Failed to persist generated device id")?;
        Ok(id)
    }

    /// Encrypted key store location
    pub fn key_store_path(&self) -> PathBuf {
        self.paths.data_dir.join("keys.json")
    }

    /// Paired device registry location
    pub fn registry_path(&self) -> PathBuf {
        self.paths.data_dir.join("paired_devices.json")
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            batch_size: self.network.scan_batch_size,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            probe_timeout: Duration::from_millis(self.network.probe_timeout_ms),
        }
    }

    /// Session settings, without a challenge policy
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.network.idle_timeout),
            session_ceiling: Duration::from_secs(self.network.session_ceiling),
            ..Default::default()
        }
    }

    /// Server settings, without a verification frame
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.network.bind_address,
            port: self.network.relay_port,
            freshness_window: Duration::from_secs(self.security.freshness_window),
            ..Default::default()
        }
    }

    /// How often the delivery worker picks up queued messages
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.delivery.worker_interval.max(1))
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_retries: self.delivery.max_retries,
            base_delay: Duration::from_secs(self.delivery.base_delay),
            max_delay: Duration::from_secs(self.delivery.max_delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.relay_port, 9224);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.security.freshness_window, 600);
        assert!(!config.security.shared_secret.is_empty());
        assert!(!config.security.require_verification);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.network.relay_port, config.network.relay_port);
        assert_eq!(parsed.security.shared_secret, config.security.shared_secret);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            name = "PC-1"
            device_type = "desktop"

            [security]
            shared_secret = "abc"

            [paths]
            config_dir = "/tmp/otp-relay"
            data_dir = "/tmp/otp-relay/data"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.network.scan_batch_size, 50);
        assert_eq!(parsed.delivery_config().base_delay, Duration::from_secs(2));
        assert_eq!(parsed.scan_options().connect_timeout, Duration::from_millis(200));
        assert_eq!(parsed.session_config().idle_timeout, Duration::from_secs(5));
        assert_eq!(parsed.worker_interval(), Duration::from_secs(5));
        assert!(parsed.source_path.is_none());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut created = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let id = created.device_id().unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.device.device_id.as_deref(), Some(id.as_str()));
        assert_eq!(reloaded.security.shared_secret, created.security.shared_secret);
    }

    #[test]
    fn test_custom_config_path_keeps_device_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");

        let mut first = Config::load_from(&path).unwrap();
        let id = first.device_id().unwrap();

        let mut second = Config::load_from(&path).unwrap();
        assert_eq!(second.device_id().unwrap(), id);
        assert_eq!(second.source_path.as_deref(), Some(path.as_path()));
        assert!(!dir.path().join(CONFIG_FILE).exists());
    }
}
