//! Daemon Configuration
//!
//! Loaded from `<config_dir>/lanconnect/daemon.toml`, created with defaults
//! the first time the daemon runs.

use anyhow::{Context, Result};
use lanconnect_protocol::discovery::DEFAULT_PORT;
use lanconnect_protocol::payload::{TRANSFER_PORT_END, TRANSFER_PORT_START};
use lanconnect_protocol::{DeviceInfo, DeviceType, ServiceConfig, TransferConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const APP_DIR: &str = "lanconnect";
const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub plugins: PluginConfig,

    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name shown to peers
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet, tv)
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Device ID (generated and saved on first run)
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery and TCP listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity broadcast interval in seconds, 0 to disable
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: u64,

    /// Payload port range start
    #[serde(default = "default_transfer_port_start")]
    pub transfer_port_start: u16,

    /// Payload port range end
    #[serde(default = "default_transfer_port_end")]
    pub transfer_port_end: u16,

    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

/// Plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enable_ping: bool,

    #[serde(default = "default_true")]
    pub enable_findmyphone: bool,

    #[serde(default = "default_true")]
    pub enable_photo: bool,

    #[serde(default = "default_true")]
    pub enable_sftp: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory (trusted devices live here)
    pub config_dir: PathBuf,

    /// Data directory (received photos, plugin cache)
    pub data_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

fn default_device_type() -> String {
    "desktop".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_broadcast_interval() -> u64 {
    5
}

fn default_transfer_port_start() -> u16 {
    TRANSFER_PORT_START
}

fn default_transfer_port_end() -> u16 {
    TRANSFER_PORT_END
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast_interval: default_broadcast_interval(),
            transfer_port_start: default_transfer_port_start(),
            transfer_port_end: default_transfer_port_end(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            enable_findmyphone: true,
            enable_photo: true,
            enable_sftp: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(APP_DIR);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(APP_DIR);

        let cert_dir = config_dir.join("certs");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: default_device_type(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                cert_dir,
            },
        }
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Load configuration from `path`, creating a default one if not found
    ///
    /// A missing device id is generated and written back, so the id stays
    /// stable across restarts.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", path))?
        } else {
            info!("No configuration at {:?}, creating defaults", path);
            Config::default()
        };

        let generated = config.device.device_id.is_none();
        if generated {
            config.device.device_id = Some(DeviceInfo::generate_device_id());
        }
        if generated || !path.exists() {
            config.save(path)?;
        }

        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;
        Ok(())
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        DeviceType::parse(&self.device.device_type)
            .with_context(|| format!("Unknown device type '{}'", self.device.device_type))
    }

    /// Our identity, without capabilities (those come from the plugins)
    pub fn identity(&self) -> Result<DeviceInfo> {
        let device_id = self
            .device
            .device_id
            .as_deref()
            .context("Device id missing from configuration")?;
        Ok(DeviceInfo::with_id(
            device_id,
            &self.device.name,
            self.device_type()?,
            self.network.port,
        ))
    }

    pub fn service_config(&self) -> ServiceConfig {
        let broadcast_interval = match self.network.broadcast_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        ServiceConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.network.port),
            broadcast_interval,
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout),
            broadcast_port: self.network.port,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            port_start: self.network.transfer_port_start,
            port_end: self.network.transfer_port_end,
        }
    }

    /// File holding the trusted certificate fingerprints
    pub fn trust_path(&self) -> PathBuf {
        self.paths.config_dir.join("trusted_devices.json")
    }

    /// Directory for per-device plugin caches
    pub fn cache_dir(&self) -> PathBuf {
        self.paths.data_dir.join("cache")
    }

    /// Directory where received photos land
    pub fn photo_dir(&self) -> PathBuf {
        self.paths.data_dir.join("photos")
    }
}
